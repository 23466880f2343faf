use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::interface::Options;

static MUSTACHE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{?\{\{(.+?)\}\}\}?").unwrap());
static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s()-]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00\s]+").unwrap());

/// Filenames that collide with device names on Windows.
const RESERVED: &[&str] = &[
    "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8", "com9", "con", "lpt1", "lpt2",
    "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9", "nul", "prn",
];

const FALLBACK_NAME: &str = "Audio";

/// Render a caller-supplied mustache template into a filesystem-safe
/// filename (including the `ATTS ` prefix and `.mp3` extension).
///
/// Recognized tokens are `{{service}}`, `{{text}}`, `{{voice}}` and any
/// field of the optional note context, matched exactly first and then
/// case-insensitively. Unresolved tokens render empty.
pub fn render_filename(
    template: &str,
    svc_id: &str,
    text: &str,
    options: &Options,
    note: Option<&HashMap<String, String>>,
) -> String {
    let substituted = MUSTACHE.replace_all(template, |caps: &regex::Captures<'_>| {
        let key = caps[1].trim();
        if key.is_empty() {
            return String::new();
        }

        match key.to_lowercase().as_str() {
            "service" => return svc_id.to_owned(),
            "text" => return text.to_owned(),
            "voice" => {
                if let Some(voice) = options.get("voice") {
                    return voice.to_string();
                }
            }
            _ => {}
        }

        if let Some(note) = note {
            if let Some(value) = note.get(key) {
                return value.clone();
            }
            for (field, value) in note {
                if field.trim().eq_ignore_ascii_case(key) {
                    return value.clone();
                }
            }
        }

        String::new() // invalid token / no such note field
    });

    let stripped = UNSAFE_CHARS.replace_all(&substituted, "");
    let collapsed = WHITESPACE.replace_all(&stripped, " ");
    let trimmed = collapsed.trim();

    let name = if trimmed.is_empty() || RESERVED.contains(&trimmed.to_lowercase().as_str()) {
        FALLBACK_NAME.to_owned()
    } else {
        trimmed.chars().take(90).collect() // accommodate NTFS path limits
    };

    format!("ATTS {name}.mp3")
}

/// Copy the cached media file to a human-named file in the scratch
/// directory. Purely presentational: the cache path and everything
/// keyed off it are untouched.
pub fn humanize(
    cache_file: &Path,
    temp_dir: &Path,
    template: &str,
    svc_id: &str,
    text: &str,
    options: &Options,
    note: Option<&HashMap<String, String>>,
) -> io::Result<PathBuf> {
    if !temp_dir.is_dir() {
        fs::create_dir_all(temp_dir)?;
    }

    let filename = render_filename(template, svc_id, text, options, note);
    let new_path = temp_dir.join(filename);
    fs::copy(cache_file, &new_path)?;
    debug!(from = %cache_file.display(), to = %new_path.display(), "humanized media file");

    Ok(new_path)
}
