//! The skills catalog.
//!
//! A skill is a Markdown file with YAML frontmatter:
//!
//! ```markdown
//! ---
//! name: release-runbook
//! description: How we cut releases.
//! always_load: true
//! ---
//! Full skill content…
//! ```
//!
//! Skills are scanned from a directory at startup.  Symlinks are
//! rejected so a skill cannot point outside the directory.  Each file's
//! SHA-256 is recorded at load and re-verified on every read; a
//! mismatched skill is skipped and audited, never served.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::schema::SkillsConfig;

// ─── Types ────────────────────────────────────────────────────────────────────

/// One loaded skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub content: String,
    pub always_load: bool,
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SkillFrontmatter {
    name: String,
    description: String,
    #[serde(default)]
    always_load: bool,
}

struct LoadedSkill {
    skill: Skill,
    sha256: String,
    disabled: bool,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ─── SkillCatalog ─────────────────────────────────────────────────────────────

/// Directory-scanned, integrity-checked skill set.
pub struct SkillCatalog {
    skills: Mutex<HashMap<String, LoadedSkill>>,
    overrides: HashMap<String, bool>,
    pub char_budget: usize,
}

impl SkillCatalog {
    /// Scan `config.directory` for `.md` skill files.  An empty directory
    /// path yields an empty catalog.  Unparseable files are skipped with
    /// a warning; symlinks are rejected outright.
    pub fn load(config: &SkillsConfig) -> Self {
        let mut skills = HashMap::new();

        if !config.directory.is_empty() {
            match fs::read_dir(&config.directory) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().and_then(|e| e.to_str()) != Some("md") {
                            continue;
                        }
                        // symlink_metadata so the link itself is inspected.
                        match fs::symlink_metadata(&path) {
                            Ok(meta) if meta.file_type().is_symlink() => {
                                log::warn!("skills: rejecting symlink {path:?}");
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                log::warn!("skills: cannot stat {path:?}: {e}");
                                continue;
                            }
                        }
                        match load_skill_file(&path) {
                            Ok((skill, sha256)) => {
                                skills.insert(
                                    skill.name.clone(),
                                    LoadedSkill {
                                        skill,
                                        sha256,
                                        disabled: false,
                                    },
                                );
                            }
                            Err(e) => log::warn!("skills: skipping {path:?}: {e}"),
                        }
                    }
                }
                Err(e) => log::warn!("skills: cannot read dir {:?}: {e}", config.directory),
            }
        }

        Self {
            skills: Mutex::new(skills),
            overrides: config.overrides.clone(),
            char_budget: config.char_budget,
        }
    }

    fn is_enabled(&self, name: &str) -> bool {
        *self.overrides.get(name).unwrap_or(&true)
    }

    /// All enabled, integrity-verified skills, sorted by name.
    ///
    /// Each skill's file is re-hashed on the way out; a mismatch disables
    /// the skill and records an audit event.
    pub fn enabled_skills(&self, audit: &AuditLogger) -> Vec<Skill> {
        let mut skills = self.skills.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();

        for loaded in skills.values_mut() {
            if loaded.disabled || !self.is_enabled(&loaded.skill.name) {
                continue;
            }
            match fs::read(&loaded.skill.path) {
                Ok(content) if sha256_hex(&content) == loaded.sha256 => {
                    out.push(loaded.skill.clone());
                }
                _ => {
                    loaded.disabled = true;
                    audit.log(
                        AuditEventType::SkillIntegrityFailure,
                        "system",
                        json!({
                            "skill": loaded.skill.name,
                            "path": loaded.skill.path.display().to_string(),
                        }),
                    );
                    log::warn!(
                        "skills: integrity mismatch for '{}'; skill disabled",
                        loaded.skill.name
                    );
                }
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

fn load_skill_file(path: &Path) -> Result<(Skill, String), String> {
    let raw = fs::read(path).map_err(|e| format!("read error: {e}"))?;
    let sha256 = sha256_hex(&raw);
    let text = String::from_utf8_lossy(&raw);

    let rest = text
        .strip_prefix("---")
        .ok_or("missing frontmatter delimiter")?;
    let (front, body) = rest
        .split_once("\n---")
        .ok_or("unterminated frontmatter")?;
    let frontmatter: SkillFrontmatter =
        serde_yaml::from_str(front).map_err(|e| format!("frontmatter parse error: {e}"))?;

    Ok((
        Skill {
            name: frontmatter.name,
            description: frontmatter.description,
            content: body.trim_start_matches('\n').to_string(),
            always_load: frontmatter.always_load,
            path: path.to_path_buf(),
        },
        sha256,
    ))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
