//! Read-only catalog of analysis skills.
//!
//! A skill lives at `<root>/<skill_id>/experience.md`: optional YAML
//! frontmatter (`name`, `description`, `tags`) followed by markdown guidance.

mod frontmatter;
mod score;

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

pub const SKILL_FILE_NAME: &str = "experience.md";
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

#[derive(Debug)]
pub enum SkillError {
    InvalidId(String),
    Io { path: PathBuf, source: io::Error },
}

impl Display for SkillError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "invalid skill id: {id:?}"),
            Self::Io { path, source } => {
                write!(f, "failed to read skill {}: {source}", path.display())
            }
        }
    }
}

impl Error for SkillError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidId(_) => None,
            Self::Io { source, .. } => Some(source),
        }
    }
}

pub type SkillResult<T> = std::result::Result<T, SkillError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillSummary {
    pub skill_id: String,
    pub name: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillMatch {
    #[serde(flatten)]
    pub skill: SkillSummary,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillLoad {
    pub found: bool,
    pub name: String,
    pub content: Option<String>,
    pub path: Option<PathBuf>,
    pub meta: Value,
}

impl SkillLoad {
    fn not_found(name: &str) -> Self {
        Self {
            found: false,
            name: name.to_string(),
            content: None,
            path: None,
            meta: json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillCatalog {
    root: PathBuf,
}

impl SkillCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All skills sorted by id. A missing root is an empty catalog.
    pub fn list(&self) -> SkillResult<Vec<SkillSummary>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SkillError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut skills = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SkillError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path().join(SKILL_FILE_NAME);
            if !path.is_file() {
                continue;
            }
            let skill_id = entry.file_name().to_string_lossy().into_owned();
            let text = read_skill_file(&path)?;
            let (front, _) = frontmatter::split(&text);
            skills.push(SkillSummary {
                name: front.name.unwrap_or_else(|| skill_id.clone()),
                skill_id,
                description: front.description,
                tags: front.tags,
                path,
            });
        }

        skills.sort_by(|a, b| a.skill_id.cmp(&b.skill_id));
        Ok(skills)
    }

    pub fn search(&self, query: &str, limit: usize) -> SkillResult<Vec<SkillMatch>> {
        let mut matches = self
            .list()?
            .into_iter()
            .map(|skill| SkillMatch {
                score: score::score(query, &skill),
                skill,
            })
            .filter(|candidate| candidate.score > 0)
            .collect::<Vec<_>>();
        matches.sort_by(|a, b| b.score.cmp(&a.score));
        matches.truncate(limit);
        debug!(query, hits = matches.len(), "skill search");
        Ok(matches)
    }

    /// Resolves by directory name first, then by frontmatter `name`.
    pub fn load(&self, skill_id: &str) -> SkillResult<SkillLoad> {
        let skill_id = skill_id.trim();
        validate_id(skill_id)?;

        let direct = self.root.join(skill_id).join(SKILL_FILE_NAME);
        if direct.is_file() {
            return load_from(&direct, skill_id);
        }

        let by_name = self
            .list()?
            .into_iter()
            .find(|skill| skill.name == skill_id);
        match by_name {
            Some(skill) => load_from(&skill.path, &skill.name),
            None => Ok(SkillLoad::not_found(skill_id)),
        }
    }
}

fn validate_id(skill_id: &str) -> SkillResult<()> {
    let traverses = skill_id.contains(['/', '\\']) || skill_id == "." || skill_id == "..";
    if skill_id.is_empty() || traverses {
        return Err(SkillError::InvalidId(skill_id.to_string()));
    }
    Ok(())
}

fn load_from(path: &Path, fallback_name: &str) -> SkillResult<SkillLoad> {
    let text = read_skill_file(path)?;
    let (front, body) = frontmatter::split(&text);
    Ok(SkillLoad {
        found: true,
        name: front.name.unwrap_or_else(|| fallback_name.to_string()),
        content: Some(body.to_string()),
        path: Some(path.to_path_buf()),
        meta: if front.raw.is_object() {
            front.raw
        } else {
            json!({})
        },
    })
}

fn read_skill_file(path: &Path) -> SkillResult<String> {
    fs::read_to_string(path).map_err(|source| SkillError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::{SkillCatalog, SkillError};
    use std::fs;
    use std::path::Path;

    fn write_skill(root: &Path, id: &str, text: &str) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).expect("create skill dir");
        fs::write(dir.join("experience.md"), text).expect("write skill");
    }

    fn catalog() -> (tempfile::TempDir, SkillCatalog) {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_skill(
            tmp.path(),
            "ma_cross",
            "---\nname: 双均线回测\ndescription: golden cross backtest\ntags: [回测, ma, strategy]\n---\nUse rolling means.\n",
        );
        write_skill(
            tmp.path(),
            "volatility",
            "---\ndescription: rolling std of returns\ntags: risk\n---\nannualize with sqrt(252)\n",
        );
        write_skill(tmp.path(), "plain", "no frontmatter here\n");
        fs::create_dir_all(tmp.path().join("not_a_skill")).expect("empty dir");
        let catalog = SkillCatalog::new(tmp.path());
        (tmp, catalog)
    }

    #[test]
    fn list_is_sorted_and_falls_back_to_directory_name() {
        let (_tmp, catalog) = catalog();
        let skills = catalog.list().expect("list");

        let ids = skills.iter().map(|s| s.skill_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["ma_cross", "plain", "volatility"]);
        assert_eq!(skills[0].name, "双均线回测");
        assert_eq!(skills[2].name, "volatility");
        assert_eq!(skills[2].tags, vec!["risk".to_string()]);
    }

    #[test]
    fn missing_root_is_an_empty_catalog() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let catalog = SkillCatalog::new(tmp.path().join("nope"));
        assert!(catalog.list().expect("list").is_empty());
        assert!(catalog.search("回测", 5).expect("search").is_empty());
    }

    #[test]
    fn search_ranks_by_score_and_drops_zero_scores() {
        let (_tmp, catalog) = catalog();
        let matches = catalog.search("双均线回测", 5).expect("search");

        assert_eq!(matches.first().map(|m| m.skill.skill_id.as_str()), Some("ma_cross"));
        assert!(matches.iter().all(|m| m.score > 0));
        assert!(matches.iter().all(|m| m.skill.skill_id != "plain"));

        let limited = catalog.search("风险 回测", 1).expect("search");
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn load_resolves_directory_then_frontmatter_name() {
        let (_tmp, catalog) = catalog();

        let by_dir = catalog.load("volatility").expect("load");
        assert!(by_dir.found);
        assert_eq!(by_dir.name, "volatility");
        assert_eq!(by_dir.content.as_deref(), Some("annualize with sqrt(252)\n"));

        let by_name = catalog.load("双均线回测").expect("load");
        assert!(by_name.found);
        assert!(by_name.path.is_some_and(|p| p.ends_with("ma_cross/experience.md")));
        assert_eq!(by_name.meta["description"], "golden cross backtest");
    }

    #[test]
    fn load_reports_not_found_with_requested_name() {
        let (_tmp, catalog) = catalog();
        let missing = catalog.load("ghost").expect("load");
        assert!(!missing.found);
        assert_eq!(missing.name, "ghost");
        assert!(missing.content.is_none());
    }

    #[test]
    fn load_rejects_path_traversal() {
        let (_tmp, catalog) = catalog();
        for id in ["../etc", "a/b", "..", ""] {
            assert!(matches!(catalog.load(id), Err(SkillError::InvalidId(_))));
        }
    }
}
