use proofsynth_core as psc;
use psc::llm::OpenAiCompatModel;
use psc::solve::Solver;
use psc::verify::{LakeVerifier, LeanVerifier, SUCCESS_MARKER};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io};

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn arg_u64(args: &[String], key: &str) -> Option<u64> {
    arg_value(args, key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn write_json(path: &std::path::Path, value: &serde_json::Value) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create dir {}: {}", parent.display(), e))?;
    }
    let mut f = fs::File::create(path)
        .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
    let s = serde_json::to_string_pretty(value).map_err(|e| format!("json encode: {e}"))?;
    io::Write::write_all(&mut f, s.as_bytes())
        .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    Ok(())
}

fn usage() -> String {
    [
        "proofsynth — LLM-assisted Lean 4 code + proof synthesis loop.",
        "",
        "Commands:",
        "  solve          --task <dir> [--repo <lean-repo>] [--max-retries N] [--timeout-s N] [--output-json <path>]",
        "  parse-response --file <path> [--output-json <path>]",
        "  verify         --repo <lean-repo> --file <path> [--timeout-s N]",
        "",
        "Notes:",
        "- Output is JSON to stdout; progress goes to stderr.",
        "- A task dir holds description.txt and task.lean ({{code}}/{{proof}} placeholders),",
        "  plus an optional tests.lean.",
        "- --repo defaults to the task dir; the Lean project root is found by walking upward.",
        "- Model selection is env-driven (OLLAMA_MODEL, GROQ_*, OPENROUTER_*, OPENAI_*;",
        "  order via PROOFSYNTH_PROVIDER_ORDER). A .env next to the repo is honored.",
    ]
    .join("\n")
}

fn emit(value: &serde_json::Value, output_json: Option<&PathBuf>) -> Result<(), String> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).map_err(|e| format!("json encode: {e}"))?
    );
    if let Some(p) = output_json {
        write_json(p, value)?;
    }
    Ok(())
}

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("");
    let rest = &args[2..];

    if cmd.is_empty() || cmd == "--help" || cmd == "-h" || cmd == "help" {
        println!("{}", usage());
        return Ok(());
    }

    match cmd {
        "solve" => {
            let task_dir = arg_value(rest, "--task")
                .ok_or_else(|| "missing --task".to_string())
                .map(PathBuf::from)?;
            let repo = arg_value(rest, "--repo")
                .map(PathBuf::from)
                .unwrap_or_else(|| task_dir.clone());
            let max_retries = arg_u64(rest, "--max-retries")
                .unwrap_or(psc::solve::DEFAULT_MAX_RETRIES as u64)
                as usize;
            let timeout_s = arg_u64(rest, "--timeout-s").unwrap_or(180);
            let output_json = arg_value(rest, "--output-json").map(PathBuf::from);

            psc::load_dotenv_if_present(&repo);
            let task = psc::load_task(&task_dir)?;
            let unit_tests = psc::load_unit_tests(&task_dir)?;

            let verifier = LakeVerifier::new(&repo, Duration::from_secs(timeout_s))?;
            let model = OpenAiCompatModel::new(Duration::from_secs(timeout_s));
            let solver = Solver::new(max_retries);

            let rt = tokio::runtime::Runtime::new()
                .map_err(|e| format!("failed to build tokio runtime: {e}"))?;
            let result = rt.block_on(solver.solve(
                &task.description,
                &task.template,
                &model,
                &verifier,
            ))?;

            let bound = psc::bind_template(&task.template, &result.code, &result.proof);
            let out = json!({
                "task": task_dir.display().to_string(),
                "repo_root": verifier.repo_root().display().to_string(),
                "result": result,
                "bound_program": bound,
                "has_unit_tests": unit_tests.is_some(),
            });
            emit(&out, output_json.as_ref())
        }
        "parse-response" => {
            let file = arg_value(rest, "--file")
                .ok_or_else(|| "missing --file".to_string())
                .map(PathBuf::from)?;
            let output_json = arg_value(rest, "--output-json").map(PathBuf::from);
            let text = fs::read_to_string(&file)
                .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
            let pair = psc::parse_code_proof(&text);
            let out = json!({ "file": file.display().to_string(), "pair": pair });
            emit(&out, output_json.as_ref())
        }
        "verify" => {
            let repo = arg_value(rest, "--repo")
                .ok_or_else(|| "missing --repo".to_string())
                .map(PathBuf::from)?;
            let file = arg_value(rest, "--file")
                .ok_or_else(|| "missing --file".to_string())
                .map(PathBuf::from)?;
            let timeout_s = arg_u64(rest, "--timeout-s").unwrap_or(180);

            psc::load_dotenv_if_present(&repo);
            let text = fs::read_to_string(&file)
                .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
            let verifier = LakeVerifier::new(&repo, Duration::from_secs(timeout_s))?;

            let rt = tokio::runtime::Runtime::new()
                .map_err(|e| format!("failed to build tokio runtime: {e}"))?;
            let result = rt.block_on(verifier.execute(&text))?;
            let out = json!({
                "file": file.display().to_string(),
                "ok": result.contains(SUCCESS_MARKER),
                "result": result,
            });
            emit(&out, None)
        }
        other => Err(format!("unknown command: {other}\n\n{}", usage())),
    }
}
