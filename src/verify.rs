use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;

/// Fixed marker the loop keys on. The verifier's result text contains this
/// string iff verification passed; otherwise the whole text is the
/// diagnostic surfaced back to the model.
pub const SUCCESS_MARKER: &str = "Lean code executed successfully.";

/// Verifier seam for the retry loop: tests script this, production uses
/// [`LakeVerifier`].
#[async_trait]
pub trait LeanVerifier: Send + Sync {
    /// Check a full Lean program, returning opaque result text.
    async fn execute(&self, program: &str) -> Result<String, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRun {
    pub ok: bool,
    pub timeout: bool,
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Walk upward from `start` until a directory contains both `lean-toolchain`
/// and a lakefile. Lean 4 (Lake) projects only.
pub fn find_lean_repo_root(start: &Path) -> Result<PathBuf, String> {
    let mut cur = start
        .canonicalize()
        .map_err(|e| format!("failed to resolve start path {}: {}", start.display(), e))?;
    for _ in 0..80 {
        let has_toolchain = cur.join("lean-toolchain").exists();
        let has_lakefile = cur.join("lakefile.lean").exists() || cur.join("lakefile.toml").exists();
        if has_toolchain && has_lakefile {
            return Ok(cur);
        }
        let Some(parent) = cur.parent() else {
            break;
        };
        let parent = parent.to_path_buf();
        if parent == cur {
            break;
        }
        cur = parent;
    }
    Err(format!(
        "Could not find Lean repo root from {} (expected lean-toolchain + lakefile.*)",
        start.display()
    ))
}

pub fn resolve_lake() -> PathBuf {
    if let Ok(lake_env) = std::env::var("LAKE") {
        let lake_env = lake_env.trim().to_string();
        if !lake_env.is_empty() {
            return PathBuf::from(lake_env);
        }
    }
    if let Some(home) = dirs::home_dir() {
        let elan_lake = home.join(".elan").join("bin").join("lake");
        if elan_lake.exists() {
            return elan_lake;
        }
    }
    PathBuf::from("lake")
}

/// Write `lean_text` to a temp file and type-check it with `lake env lean`
/// inside `repo_root`, bounded by `timeout_s`.
pub async fn run_lean(
    repo_root: &Path,
    lean_text: &str,
    timeout_s: Duration,
) -> Result<VerifyRun, String> {
    let lake = resolve_lake();

    let mut tmp = NamedTempFile::new().map_err(|e| format!("failed to create temp file: {}", e))?;
    std::io::Write::write_all(&mut tmp, lean_text.as_bytes())
        .map_err(|e| format!("failed to write temp lean file: {}", e))?;
    let tmp_path = tmp.into_temp_path();
    let tmp_path_buf = tmp_path.to_path_buf();

    let mut cmd = Command::new(&lake);
    cmd.arg("env")
        .arg("lean")
        .arg(&tmp_path_buf)
        .current_dir(repo_root);

    let out = tokio::time::timeout(timeout_s, cmd.output()).await;

    let run = match out {
        Err(_) => VerifyRun {
            ok: false,
            timeout: true,
            returncode: None,
            stdout: String::new(),
            stderr: String::new(),
        },
        Ok(Err(e)) => VerifyRun {
            ok: false,
            timeout: false,
            returncode: None,
            stdout: String::new(),
            stderr: format!("failed to execute {}: {}", lake.display(), e),
        },
        Ok(Ok(output)) => VerifyRun {
            ok: output.status.success(),
            timeout: false,
            returncode: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
    };

    // Clean up the tempfile even on timeout.
    let _ = std::fs::remove_file(&tmp_path_buf);

    Ok(run)
}

/// Collapse a verify run into the single result text the loop consumes.
pub fn result_text(run: &VerifyRun) -> String {
    if run.ok {
        let extra = run.stdout.trim();
        if extra.is_empty() {
            return SUCCESS_MARKER.to_string();
        }
        return format!("{SUCCESS_MARKER}\n{extra}");
    }
    if run.timeout {
        return "Lean verification timed out.".to_string();
    }
    let mut out = String::new();
    if !run.stdout.trim().is_empty() {
        out.push_str(run.stdout.trim_end());
        out.push('\n');
    }
    if !run.stderr.trim().is_empty() {
        out.push_str(run.stderr.trim_end());
        out.push('\n');
    }
    if out.trim().is_empty() {
        out = format!(
            "Lean exited with code {:?} and no diagnostics.",
            run.returncode
        );
    }
    out.trim_end().to_string()
}

/// Production verifier: `lake env lean` in a fixed Lean repo.
#[derive(Debug, Clone)]
pub struct LakeVerifier {
    repo_root: PathBuf,
    timeout: Duration,
}

impl LakeVerifier {
    pub fn new(start: &Path, timeout: Duration) -> Result<Self, String> {
        let repo_root = find_lean_repo_root(start)?;
        Ok(Self { repo_root, timeout })
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

#[async_trait]
impl LeanVerifier for LakeVerifier {
    async fn execute(&self, program: &str) -> Result<String, String> {
        let run = run_lean(&self.repo_root, program, self.timeout).await?;
        Ok(result_text(&run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ok: bool, timeout: bool, stdout: &str, stderr: &str) -> VerifyRun {
        VerifyRun {
            ok,
            timeout,
            returncode: if ok { Some(0) } else { Some(1) },
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn success_text_carries_marker() {
        let t = result_text(&run(true, false, "", ""));
        assert_eq!(t, SUCCESS_MARKER);
        let t = result_text(&run(true, false, "warning: foo\n", ""));
        assert!(t.contains(SUCCESS_MARKER));
        assert!(t.contains("warning: foo"));
    }

    #[test]
    fn failure_text_is_diagnostics_without_marker() {
        let t = result_text(&run(false, false, "Foo.lean:3:1: error: boom\n", ""));
        assert!(!t.contains(SUCCESS_MARKER));
        assert!(t.contains("error: boom"));
    }

    #[test]
    fn timeout_text_lacks_marker() {
        let t = result_text(&run(false, true, "", ""));
        assert!(!t.contains(SUCCESS_MARKER));
        assert!(t.contains("timed out"));
    }

    #[test]
    fn find_repo_root_requires_markers() {
        let td = tempfile::tempdir().unwrap();
        assert!(find_lean_repo_root(td.path()).is_err());

        std::fs::write(td.path().join("lean-toolchain"), "leanprover/lean4:v4.9.0\n").unwrap();
        std::fs::write(td.path().join("lakefile.toml"), "name = \"demo\"\n").unwrap();
        let root = find_lean_repo_root(td.path()).unwrap();
        assert_eq!(root, td.path().canonicalize().unwrap());

        // Nested start dirs resolve to the same root.
        let nested = td.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_lean_repo_root(&nested).unwrap(), root);
    }
}
