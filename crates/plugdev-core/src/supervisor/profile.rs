//! Target profile directory and preference overrides.
//!
//! Preferences are applied through the profile's `user.js` before launch,
//! never over the protocol. Each entry is one line:
//!
//! ```text
//! user_pref("devtools.debugger.remote-enabled", true);
//! ```
//!
//! Lines for preferences we do not manage are preserved when the profile
//! already has a `user.js`.

use crate::config::ProcessConfig;
use crate::error::{HarnessError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// The profile directory the target runs with.
#[derive(Debug)]
pub struct Profile {
    dir: PathBuf,
    temp: Option<TempDir>,
}

impl Profile {
    /// Use the configured directory (created if missing) or a fresh temporary one.
    pub fn prepare(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| HarnessError::io_with_path(e, dir))?;
                Ok(Self {
                    dir: dir.to_path_buf(),
                    temp: None,
                })
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("plugdev-profile-")
                    .tempdir()?;
                debug!("Using temporary profile {}", temp.path().display());
                Ok(Self {
                    dir: temp.path().to_path_buf(),
                    temp: Some(temp),
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Write `prefs` into the profile's `user.js`. Returns the file path.
    pub fn write_prefs(&self, prefs: &BTreeMap<String, Value>) -> Result<PathBuf> {
        let path = self.dir.join(ProcessConfig::PREFS_FILE_NAME);

        let existing = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(HarnessError::io_with_path(e, &path)),
        };

        let mut lines: Vec<String> = existing
            .lines()
            .filter(|line| {
                pref_name(line)
                    .map(|name| !prefs.contains_key(name))
                    .unwrap_or(true)
            })
            .map(String::from)
            .collect();

        for (key, value) in prefs {
            lines.push(render_pref(key, value)?);
        }

        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(&path, contents).map_err(|e| HarnessError::io_with_path(e, &path))?;

        debug!("Wrote {} preferences to {}", prefs.len(), path.display());
        Ok(path)
    }

    /// Delete the profile if it is temporary. Configured profiles are kept.
    pub fn remove(self) -> Result<()> {
        match self.temp {
            Some(temp) => {
                debug!("Removing temporary profile {}", temp.path().display());
                temp.close()
                    .map_err(|e| HarnessError::io_with_path(e, &self.dir))
            }
            None => Ok(()),
        }
    }
}

/// Render one `user_pref` line.
///
/// Booleans, numbers and strings are written as-is. Arrays and objects are
/// stored as their JSON text. Null has no preference representation.
pub fn render_pref(key: &str, value: &Value) -> Result<String> {
    let literal = match value {
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()).to_string(),
        Value::Null => {
            return Err(HarnessError::Config {
                message: format!("preference {} has a null value", key),
            })
        }
    };
    Ok(format!(
        "user_pref({}, {});",
        Value::String(key.to_string()),
        literal
    ))
}

/// Name of the preference a `user_pref(...)` line sets.
fn pref_name(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("user_pref(")?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_render_scalars() {
        assert_eq!(
            render_pref("a.b", &json!(true)).unwrap(),
            r#"user_pref("a.b", true);"#
        );
        assert_eq!(
            render_pref("a.n", &json!(10)).unwrap(),
            r#"user_pref("a.n", 10);"#
        );
        assert_eq!(
            render_pref("a.s", &json!("say \"hi\"")).unwrap(),
            r#"user_pref("a.s", "say \"hi\"");"#
        );
    }

    #[test]
    fn test_render_structured_as_string() {
        assert_eq!(
            render_pref("a.list", &json!([1, 2])).unwrap(),
            r#"user_pref("a.list", "[1,2]");"#
        );
        assert!(render_pref("a.null", &Value::Null).is_err());
    }

    #[test]
    fn test_write_prefs_replaces_managed_lines() {
        let dir = TempDir::new().unwrap();
        let user_js = dir.path().join("user.js");
        std::fs::write(
            &user_js,
            "user_pref(\"keep.me\", 1);\nuser_pref(\"devtools.chrome.enabled\", false);\n",
        )
        .unwrap();

        let profile = Profile::prepare(Some(dir.path())).unwrap();
        let mut prefs = BTreeMap::new();
        prefs.insert("devtools.chrome.enabled".to_string(), json!(true));
        profile.write_prefs(&prefs).unwrap();

        let contents = std::fs::read_to_string(&user_js).unwrap();
        assert_eq!(
            contents,
            "user_pref(\"keep.me\", 1);\nuser_pref(\"devtools.chrome.enabled\", true);\n"
        );
    }

    #[test]
    fn test_temporary_profile_is_removed() {
        let profile = Profile::prepare(None).unwrap();
        assert!(profile.is_temporary());
        let path = profile.path().to_path_buf();
        assert!(path.is_dir());

        profile.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_configured_profile_is_kept() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("profiles").join("dev");
        let profile = Profile::prepare(Some(&nested)).unwrap();
        assert!(!profile.is_temporary());
        profile.remove().unwrap();
        assert!(nested.is_dir());
    }
}
