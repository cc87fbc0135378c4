use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub mod llm;
pub mod solve;
pub mod verify;

/// Placeholder markers inside a task template. Each appears at most once;
/// the binder must leave every other byte of the template untouched.
pub const CODE_PLACEHOLDER: &str = "{{code}}";
pub const PROOF_PLACEHOLDER: &str = "{{proof}}";

/// Lean's admit-without-proof keyword. Used as the default for either slot
/// whenever extraction fails or yields empty text, so a candidate pair is
/// always substitutable.
pub const SORRY: &str = "sorry";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub code: String,
    pub proof: String,
}

impl CandidatePair {
    pub fn sorry_pair() -> Self {
        Self {
            code: SORRY.to_string(),
            proof: SORRY.to_string(),
        }
    }

    /// True when either slot is still the admitted stub.
    pub fn has_sorry(&self) -> bool {
        self.code == SORRY || self.proof == SORRY
    }
}

/// Case-insensitive search for an ASCII marker; returns the byte offset of
/// the first occurrence. ASCII lowercasing preserves byte positions.
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    text.to_ascii_lowercase().find(&marker.to_ascii_lowercase())
}

/// Remove markdown code-fence delimiters (``` optionally tagged `lean`).
/// These are formatting artifacts of the model, not part of the candidate.
fn strip_fences(s: &str) -> String {
    let Ok(open) = Regex::new(r"```(?:lean)?\s*") else {
        return s.to_string();
    };
    let Ok(close) = Regex::new(r"\s*```") else {
        return s.to_string();
    };
    let out = open.replace_all(s, "").to_string();
    close.replace_all(&out, "").to_string()
}

/// Drop a redundant leading `def name (args) : ret :=` header line. Models
/// sometimes repeat the signature even when asked for the body only.
fn strip_def_header(s: &str) -> String {
    let Ok(re) = Regex::new(r"(?m)^def\s+\w+\s*\(.*\)\s*:.*:=\s*") else {
        return s.to_string();
    };
    re.replace_all(s, "").to_string()
}

/// Rewrite proof lines that start with `.`, `·`, or `•` (plus optional
/// whitespace) to start with the canonical `· ` bullet. Lean accepts several
/// bullet notations; normalizing keeps the substituted proof consistent.
fn normalize_bullets(s: &str) -> String {
    let lines: Vec<String> = s
        .lines()
        .map(|ln| {
            let t = ln.trim_start();
            let rest = t
                .strip_prefix('·')
                .or_else(|| t.strip_prefix('•'))
                .or_else(|| t.strip_prefix('.'));
            match rest {
                Some(r) => format!("· {}", r.trim_start()),
                None => ln.to_string(),
            }
        })
        .collect();
    lines.join("\n")
}

/// Extract a candidate pair from raw model output.
///
/// Two-phase scan: locate the `CODE:` / `PROOF:` markers (case-insensitive,
/// first occurrence each; the code span runs up to the next `PROOF:` or end
/// of text, the proof span runs to end of text), then apply a fixed ordered
/// list of normalization passes per span. Never fails: an empty or missing
/// span falls back to `sorry`.
pub fn parse_code_proof(response: &str) -> CandidatePair {
    let code_span = find_marker(response, "CODE:").map(|i| {
        let after = &response[i + "CODE:".len()..];
        match find_marker(after, "PROOF:") {
            Some(j) => &after[..j],
            None => after,
        }
    });
    let proof_span = find_marker(response, "PROOF:").map(|i| &response[i + "PROOF:".len()..]);

    let code = code_span
        .map(|s| strip_def_header(&strip_fences(s.trim())).trim().to_string())
        .unwrap_or_default();
    let proof = proof_span
        .map(|s| normalize_bullets(&strip_fences(s.trim())).trim().to_string())
        .unwrap_or_default();

    CandidatePair {
        code: if code.is_empty() {
            SORRY.to_string()
        } else {
            code
        },
        proof: if proof.is_empty() {
            SORRY.to_string()
        } else {
            proof
        },
    }
}

/// Substitute the candidates into the template. Replaces the first
/// occurrence of each placeholder; an absent placeholder is skipped silently
/// (templates are assumed well-formed per the task contract). No other
/// template text is altered.
pub fn bind_template(template: &str, code: &str, proof: &str) -> String {
    let out = template.replacen(CODE_PLACEHOLDER, code, 1);
    out.replacen(PROOF_PLACEHOLDER, proof, 1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFiles {
    pub description: String,
    pub template: String,
}

/// Read `description.txt` and `task.lean` from a task directory.
pub fn load_task(dir: &Path) -> Result<TaskFiles, String> {
    let desc_path = dir.join("description.txt");
    let template_path = dir.join("task.lean");
    let description = std::fs::read_to_string(&desc_path)
        .map_err(|e| format!("failed to read {}: {}", desc_path.display(), e))?;
    let template = std::fs::read_to_string(&template_path)
        .map_err(|e| format!("failed to read {}: {}", template_path.display(), e))?;
    Ok(TaskFiles {
        description,
        template,
    })
}

/// Read the optional `tests.lean` acceptance tests. They are surfaced to
/// callers but never interpreted here.
pub fn load_unit_tests(dir: &Path) -> Result<Option<String>, String> {
    let p = dir.join("tests.lean");
    if !p.exists() {
        return Ok(None);
    }
    std::fs::read_to_string(&p)
        .map(Some)
        .map_err(|e| format!("failed to read {}: {}", p.display(), e))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSignature {
    pub name: String,
    pub args: String,
    pub ret: String,
}

/// Pull the `def NAME (ARGS) : RET :=` signature out of the template, with
/// generic fallbacks when the pattern misses (the prompt still reads fine).
pub fn extract_signature(template: &str) -> TemplateSignature {
    let fallback = TemplateSignature {
        name: "function".to_string(),
        args: "args".to_string(),
        ret: "return_type".to_string(),
    };
    let Ok(re) = Regex::new(r"(?s)def\s+(\w+)\s*\((.*?)\)\s*:(.*?):=") else {
        return fallback;
    };
    let Some(cap) = re.captures(template) else {
        return fallback;
    };
    TemplateSignature {
        name: cap.get(1).map(|m| m.as_str()).unwrap_or("function").to_string(),
        args: cap.get(2).map(|m| m.as_str()).unwrap_or("args").to_string(),
        ret: cap
            .get(3)
            .map(|m| m.as_str())
            .unwrap_or("return_type")
            .to_string(),
    }
}

/// Extract the specification region between the fixed marker comments.
/// Returns an empty string when the markers are absent.
pub fn extract_spec_block(template: &str) -> String {
    let Ok(re) = Regex::new(r"(?s)-- << SPEC START >>(.*?)-- << SPEC END >>") else {
        return String::new();
    };
    re.captures(template)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Ok(text) = std::fs::read_to_string(path) else {
        return out;
    };
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        let mut v = v.trim();
        // Strip one matching pair of surrounding quotes.
        if v.len() >= 2 {
            let b = v.as_bytes();
            if b[0] == b[v.len() - 1] && (b[0] == b'"' || b[0] == b'\'') {
                v = &v[1..v.len() - 1];
            }
        }
        out.insert(k.to_string(), v.to_string());
    }
    out
}

/// Merge `<dir>/.env` into the process env. Never overrides variables that
/// are already set.
pub fn load_dotenv_if_present(dir: &Path) {
    for (k, v) in parse_dotenv(&dir.join(".env")) {
        if std::env::var(&k).ok().as_deref().unwrap_or("").is_empty() {
            std::env::set_var(k, v);
        }
    }
}

pub(crate) fn env_truthy(name: &str, default_on: bool) -> bool {
    let v = std::env::var(name).ok().unwrap_or_default();
    let v = v.trim().to_lowercase();
    if v.is_empty() {
        return default_on;
    }
    !matches!(v.as_str(), "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_sections() {
        let pair = parse_code_proof("CODE:\nx+1\nPROOF:\nrfl");
        assert_eq!(pair.code, "x+1");
        assert_eq!(pair.proof, "rfl");
    }

    #[test]
    fn parse_is_case_insensitive() {
        let pair = parse_code_proof("code:\na * b\nproof:\nsimp");
        assert_eq!(pair.code, "a * b");
        assert_eq!(pair.proof, "simp");
    }

    #[test]
    fn parse_no_markers_yields_sorry_pair() {
        let pair = parse_code_proof("I cannot solve this problem.");
        assert_eq!(pair, CandidatePair::sorry_pair());
    }

    #[test]
    fn parse_empty_sections_yield_sorry() {
        let pair = parse_code_proof("CODE:\nPROOF:\n");
        assert_eq!(pair.code, "sorry");
        assert_eq!(pair.proof, "sorry");
    }

    #[test]
    fn parse_strips_markdown_fences() {
        let pair = parse_code_proof("CODE:\n```lean\nn % 11 = 0\n```\nPROOF:\n```\nsimp\n```");
        assert_eq!(pair.code, "n % 11 = 0");
        assert_eq!(pair.proof, "simp");
    }

    #[test]
    fn parse_strips_redundant_def_header() {
        let pair = parse_code_proof("CODE:\ndef ident (x : Nat) : Nat := x\nPROOF:\nrfl");
        assert_eq!(pair.code, "x");
        assert_eq!(pair.proof, "rfl");
    }

    #[test]
    fn parse_uses_first_code_span_only() {
        // Duplicate markers: the code span is non-greedy up to the first
        // PROOF:, the proof span is greedy to end of text.
        let pair = parse_code_proof("CODE:\na\nPROOF:\nrfl\nCODE:\nb");
        assert_eq!(pair.code, "a");
        assert_eq!(pair.proof, "rfl\nCODE:\nb");
    }

    #[test]
    fn parse_normalizes_bullets() {
        let pair = parse_code_proof(
            "CODE:\nx\nPROOF:\ncases h\n. simp\n·   rfl\n•\texact h2\nexact trivial",
        );
        assert_eq!(
            pair.proof,
            "cases h\n· simp\n· rfl\n· exact h2\nexact trivial"
        );
    }

    #[test]
    fn bullet_lines_not_starting_with_glyph_are_untouched() {
        assert_eq!(normalize_bullets("simp [h.foo]"), "simp [h.foo]");
        assert_eq!(normalize_bullets("  exact x"), "  exact x");
    }

    #[test]
    fn parse_is_idempotent_on_normalized_output() {
        let first = parse_code_proof(
            "CODE:\n```lean\ndef f (x : Nat) : Nat := x + 1\n```\nPROOF:\n. simp\n. rfl",
        );
        let rebuilt = format!("CODE:\n{}\nPROOF:\n{}", first.code, first.proof);
        let second = parse_code_proof(&rebuilt);
        assert_eq!(first, second);
    }

    #[test]
    fn bind_replaces_both_placeholders() {
        let bound = bind_template("theorem t := {{code}} ... {{proof}}", "x+1", "rfl");
        assert_eq!(bound, "theorem t := x+1 ... rfl");
    }

    #[test]
    fn bind_replaces_first_occurrence_only() {
        let bound = bind_template("{{code}} {{code}} {{proof}}", "a", "b");
        assert_eq!(bound, "a {{code}} b");
    }

    #[test]
    fn bind_leaves_other_text_byte_identical() {
        let template = "-- header\ndef f : Nat := {{code}}\n-- footer";
        let bound = bind_template(template, "0", "rfl");
        assert_eq!(bound, "-- header\ndef f : Nat := 0\n-- footer");
    }

    #[test]
    fn bind_skips_missing_markers_silently() {
        assert_eq!(bind_template("no markers here", "a", "b"), "no markers here");
    }

    #[test]
    fn signature_extraction() {
        let t = "import Mathlib\ndef cubeSurfaceArea (size : Int) : Int := {{code}}";
        let sig = extract_signature(t);
        assert_eq!(sig.name, "cubeSurfaceArea");
        assert_eq!(sig.args.trim(), "size : Int");
        assert_eq!(sig.ret.trim(), "Int");
    }

    #[test]
    fn signature_extraction_falls_back() {
        let sig = extract_signature("theorem only, no def");
        assert_eq!(sig.name, "function");
        assert_eq!(sig.args, "args");
        assert_eq!(sig.ret, "return_type");
    }

    #[test]
    fn spec_block_extraction() {
        let t = "def f : Nat := {{code}}\n-- << SPEC START >>\nresult = x\n-- << SPEC END >>\n";
        assert_eq!(extract_spec_block(t), "result = x");
        assert_eq!(extract_spec_block("no markers"), "");
    }
}
