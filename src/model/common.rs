use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

pub type Id = String;

/// Generate a prefixed opaque identifier, e.g. `proj_1f0c...`
pub fn generate_id(prefix: &str) -> Id {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

static NON_WORD: OnceLock<Regex> = OnceLock::new();
static SEPARATORS: OnceLock<Regex> = OnceLock::new();
static DASHES: OnceLock<Regex> = OnceLock::new();

/// URL-friendly slug for a display name ("Hello World!" -> "hello-world")
pub fn name_to_slug(name: &str) -> String {
    let non_word = NON_WORD.get_or_init(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
    let separators = SEPARATORS.get_or_init(|| Regex::new(r"[\s_]+").expect("valid regex"));
    let dashes = DASHES.get_or_init(|| Regex::new(r"-+").expect("valid regex"));

    let lowered = name.to_lowercase();
    let cleaned = non_word.replace_all(&lowered, " ");
    let joined = separators.replace_all(cleaned.trim(), "-");
    let collapsed = dashes.replace_all(&joined, "-");
    collapsed.trim_matches('-').to_string()
}
