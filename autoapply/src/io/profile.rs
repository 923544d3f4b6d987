//! Applicant profile loaded from `<state_dir>/profile.toml`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SYMBOLS: &[u8] = b"!@#$%^&*";
const SECRET_LEN: usize = 16;

/// Read-only applicant data for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub location: String,
    pub linkedin: String,
    pub website: String,
    pub gender: String,
    pub race: String,
    pub veteran: String,
    pub disability: String,
    /// Plain-text resume used to answer free-form questions.
    pub resume_text: String,
    /// Default file for `Upload_File` when no path is given.
    pub resume_path: Option<PathBuf>,
    /// Additional question/answer pairs, keyed by a short field name.
    pub answers: BTreeMap<String, String>,
    #[serde(skip)]
    secret: OnceLock<String>,
}

fn normalize_field(field: &str) -> String {
    field
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

impl Profile {
    /// Look up one field. Unknown or empty fields yield a bracketed marker.
    pub fn get(&self, field: &str) -> String {
        let key = normalize_field(field);
        let value = match key.as_str() {
            "password" | "secret" => Some(self.secret().to_string()),
            "name" | "full_name" => Some(self.name.clone()),
            "first_name" => self.name.split_whitespace().next().map(str::to_string),
            "last_name" => self.name.split_whitespace().last().map(str::to_string),
            "email" => Some(self.email.clone()),
            "phone" => Some(self.phone.clone()),
            "location" | "city" => Some(self.location.clone()),
            "linkedin" => Some(self.linkedin.clone()),
            "website" | "portfolio" => Some(self.website.clone()),
            "gender" => Some(self.gender.clone()),
            "race" | "ethnicity" => Some(self.race.clone()),
            "veteran" => Some(self.veteran.clone()),
            "disability" => Some(self.disability.clone()),
            "resume" | "resume_text" => Some(self.resume_text.clone()),
            "resume_path" => self.resume_path.as_ref().map(|p| p.display().to_string()),
            _ => self
                .answers
                .iter()
                .find(|(k, _)| normalize_field(k) == key)
                .map(|(_, v)| v.clone()),
        };
        value
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("[{field} not found in profile]"))
    }

    /// Shared account password surrogate, generated once per process.
    pub fn secret(&self) -> &str {
        self.secret
            .get_or_init(|| generate_secret(&mut rand::thread_rng()))
    }

    /// Profile as prompt context. The secret is never included.
    pub fn render_for_prompt(&self) -> String {
        let mut buf = String::new();
        let fields = [
            ("name", &self.name),
            ("email", &self.email),
            ("phone", &self.phone),
            ("location", &self.location),
            ("linkedin", &self.linkedin),
            ("website", &self.website),
            ("gender", &self.gender),
            ("race", &self.race),
            ("veteran", &self.veteran),
            ("disability", &self.disability),
        ];
        for (key, value) in fields {
            if !value.trim().is_empty() {
                let _ = writeln!(buf, "{key}: {}", value.trim());
            }
        }
        for (key, value) in &self.answers {
            let _ = writeln!(buf, "{key}: {}", value.trim());
        }
        if !self.resume_text.trim().is_empty() {
            let _ = write!(buf, "\nresume:\n{}", self.resume_text.trim());
        }
        buf.trim_end().to_string()
    }

    fn missing_core_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("email", &self.email),
            ("phone", &self.phone),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect()
    }
}

/// 16 characters from `[A-Za-z0-9!@#$%^&*]` with at least one lowercase,
/// one uppercase, three digits and one symbol.
pub fn generate_secret<R: Rng>(rng: &mut R) -> String {
    let alphabet: Vec<u8> = [LOWER, UPPER, DIGITS, SYMBOLS].concat();
    let mut pick = |set: &[u8]| set[rng.gen_range(0..set.len())];

    let mut chars = vec![pick(LOWER), pick(UPPER), pick(SYMBOLS)];
    chars.extend((0..3).map(|_| pick(DIGITS)));
    while chars.len() < SECRET_LEN {
        chars.push(pick(&alphabet));
    }
    chars.shuffle(rng);
    chars.into_iter().map(char::from).collect()
}

/// Load the profile. A missing file yields an empty profile with a warning.
pub fn load_profile(path: &Path) -> Result<Profile> {
    if !path.exists() {
        warn!(path = %path.display(), "profile not found; using an empty profile");
        return Ok(Profile::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let profile: Profile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let missing = profile.missing_core_fields();
    if !missing.is_empty() {
        warn!(?missing, "profile is missing core fields");
    }
    if let Some(resume) = &profile.resume_path
        && !resume.is_file()
    {
        warn!(path = %resume.display(), "profile resume_path does not exist");
    }
    info!(path = %path.display(), "loaded profile");
    Ok(profile)
}

pub const PROFILE_TEMPLATE: &str = r#"# Applicant profile used to fill application forms.
name = ""
email = ""
phone = ""
location = ""
linkedin = ""
website = ""

# Voluntary self-identification answers.
gender = "Decline to self-identify"
race = "Decline to self-identify"
veteran = "I am not a protected veteran"
disability = "I do not wish to answer"

# resume_path = "/absolute/path/to/resume.pdf"
resume_text = """
"""

[answers]
# work_authorization = "Yes"
# requires_sponsorship = "No"
"#;
