use std::env;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Expand a leading `~` and absolutize against the current directory. No
/// symlink resolution and no filesystem access.
pub fn safe_expand(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let expanded = if trimmed == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = trimmed.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(trimmed),
        }
    } else {
        PathBuf::from(trimmed)
    };

    if expanded.is_absolute() {
        expanded
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}

/// Create `dir` if needed and prove it is writable by touching a probe file.
/// Catches read-only mounts that `create_dir_all` alone would not.
pub async fn ensure_writable_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let meta = tokio::fs::metadata(dir).await?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let probe = dir.join(format!(".write-probe-{}", Uuid::new_v4()));
    tokio::fs::write(&probe, b"").await?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_expand_keeps_absolute_paths() {
        assert_eq!(safe_expand("/opt/models"), PathBuf::from("/opt/models"));
        assert_eq!(safe_expand("  /opt/models  "), PathBuf::from("/opt/models"));
    }

    #[test]
    fn test_safe_expand_absolutizes_relative_paths() {
        let cwd = env::current_dir().unwrap();
        assert_eq!(safe_expand("models"), cwd.join("models"));
        assert_eq!(safe_expand("./models"), cwd.join("./models"));
    }

    #[test]
    fn test_safe_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(safe_expand("~"), home);
        assert_eq!(safe_expand("~/models"), home.join("models"));
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_creates_nested_dirs() {
        let base = tempfile::tempdir().unwrap();
        let nested = base.path().join("a/b/c");
        ensure_writable_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        // The probe file must not be left behind.
        assert_eq!(std::fs::read_dir(&nested).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_writable_dir_rejects_files() {
        let base = tempfile::tempdir().unwrap();
        let file = base.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_writable_dir(&file).await.is_err());
    }
}
