use serde::{Deserialize, Serialize};

use crate::llm::{ChatModel, Message};
use crate::verify::{LeanVerifier, SUCCESS_MARKER};
use crate::{
    bind_template, env_truthy, extract_signature, extract_spec_block, parse_code_proof,
    CandidatePair, SORRY,
};

pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Final loop result. `verified` is explicit on purpose: the loop always
/// returns a candidate pair, and callers must be able to tell a verified
/// pair from a budget-exhausted, possibly still-broken one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveResult {
    pub code: String,
    pub proof: String,
    pub verified: bool,
    /// Model/verifier round trips actually performed (1-based).
    pub attempts: usize,
    /// Verifier result text from the last attempt.
    pub last_result: String,
}

/// Classification of one attempt, in priority order. A `sorry` stub is
/// indistinguishable from "gave up" and gets a completeness nudge rather
/// than a correction, even though both are verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Stub,
    HardFailure,
}

pub fn classify(result: &str, pair: &CandidatePair) -> Outcome {
    if result.contains(SUCCESS_MARKER) {
        return Outcome::Success;
    }
    if pair.code == SORRY || pair.proof == SORRY {
        return Outcome::Stub;
    }
    Outcome::HardFailure
}

pub fn system_prompt() -> String {
    [
        "You are an expert Lean 4 programmer.",
        "Your task is to complete a Lean code template by providing only the implementation and proof.",
        "DO NOT redefine the function or theorem. Just provide the body of the implementation and proof.",
        "",
        "The template uses {{code}} and {{proof}} placeholders. I need:",
        "1. ONLY the code to replace {{code}} - just the implementation body",
        "2. ONLY the proof to replace {{proof}} - just the proof body",
        "",
        "For proofs, remember:",
        "- Don't use period (.) or bullet points like (· or •) at the beginning of lines in the proof",
        "- For most simple cases, use 'simp' or 'rfl' tactics",
        "- For cases that need analysis, use:",
        "  cases h : expr with",
        "  | case1 => ...",
        "  | case2 => ...",
        "- Don't use 'focus' or 'by' in your proofs",
        "- Always ensure your proof has no unexpected syntax",
        "",
        "Format your answer EXACTLY like this:",
        "CODE:",
        "[your implementation code only]",
        "PROOF:",
        "[your proof only]",
    ]
    .join("\n")
}

/// Worked examples shown in the initial prompt. Small, verified pairs keep
/// the model anchored on body-only answers.
fn example_pairs() -> String {
    [
        "Example 1:",
        "Function: def ident (x : Nat) : Nat",
        "Specification: result = x",
        "CODE: x",
        "PROOF: rfl",
        "",
        "Example 2:",
        "Function: def isDivisibleBy11 (n : Int) : Bool",
        "Specification: n % 11 = 0",
        "CODE: n % 11 = 0",
        "PROOF: simp",
        "",
        "Example 3:",
        "Function: def multiply (a b : Int) : Int",
        "Specification: result = a * b",
        "CODE: a * b",
        "PROOF: rfl",
        "",
        "Example 4:",
        "Function: def cubeSurfaceArea (size : Int) : Int",
        "Specification: result = 6 * size * size",
        "CODE: 6 * size * size",
        "PROOF: rfl",
    ]
    .join("\n")
}

pub fn initial_user_prompt(description: &str, template: &str) -> String {
    let sig = extract_signature(template);
    let spec = extract_spec_block(template);
    format!(
        "Problem Description:\n{description}\n\n\
Lean Code Template:\n```lean\n{template}\n```\n\n\
For the function '{name}', I need:\n\
1. The implementation code to replace {{{{code}}}}\n\
2. The proof to replace {{{{proof}}}}\n\n\
The specification is:\n```lean\n{spec}\n```\n\n\
Here are some examples of successful implementations and proofs:\n{examples}\n\n\
DO NOT include:\n\
- Function definitions (def ...)\n\
- Theorem definitions (theorem ...)\n\
- Any imports\n\
- Just provide the exact code and proof bodies.\n\n\
Remember to format your answer using CODE: and PROOF: markers.",
        name = sig.name,
        examples = example_pairs(),
    )
}

pub fn stub_feedback() -> String {
    "Your solution contains 'sorry'. Please provide a complete implementation and proof \
without using 'sorry'. Just provide the exact code and proof body that should replace \
{{code}} and {{proof}} respectively."
        .to_string()
}

pub fn failure_feedback(diagnostic: &str) -> String {
    format!(
        "Your solution had errors:\n{diagnostic}\n\n\
Please fix the code and proof. Remember:\n\
1. ONLY provide the exact body for {{{{code}}}} and {{{{proof}}}}\n\
2. Do not include function definitions or extra formatting\n\
3. Avoid using dots (.) at the beginning of lines in the proof\n\
4. Do not use nested syntax like 'by_cases h' inside a case\n\
5. Use simple proof tactics like 'simp', 'rfl', 'exact', etc."
    )
}

/// The retry orchestrator. Owns the conversation, the attempt counter, and
/// final-result selection; collaborators come in through the two trait
/// seams.
#[derive(Debug, Clone)]
pub struct Solver {
    pub max_retries: usize,
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl Solver {
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries }
    }

    /// Run the model/verifier loop for one task. Each iteration: model call,
    /// parse, bind, verify, classify; then either terminate or append
    /// feedback. Performs at most `max_retries` model calls and
    /// `max_retries` verifier calls. Infrastructure failures (HTTP, spawn)
    /// are `Err`; a still-failing pair at budget exhaustion is a normal
    /// `Ok` with `verified: false`.
    pub async fn solve(
        &self,
        description: &str,
        template: &str,
        model: &dyn ChatModel,
        verifier: &dyn LeanVerifier,
    ) -> Result<SolveResult, String> {
        let progress = env_truthy("PROOFSYNTH_PROGRESS", true);
        let mut messages = vec![
            Message::system(&system_prompt()),
            Message::user(&initial_user_prompt(description, template)),
        ];
        let mut pair = CandidatePair::sorry_pair();
        let mut last_result = String::new();

        for attempt in 0..self.max_retries {
            if progress {
                eprintln!("solve[attempt {}/{}]", attempt + 1, self.max_retries);
            }
            let response = model.get_response(&messages).await?;
            pair = parse_code_proof(&response);
            let bound = bind_template(template, &pair.code, &pair.proof);
            last_result = verifier.execute(&bound).await?;

            match classify(&last_result, &pair) {
                Outcome::Success => {
                    if progress {
                        eprintln!("solve[verified on attempt {}]", attempt + 1);
                    }
                    return Ok(SolveResult {
                        code: pair.code,
                        proof: pair.proof,
                        verified: true,
                        attempts: attempt + 1,
                        last_result,
                    });
                }
                Outcome::Stub => {
                    if progress {
                        eprintln!("solve[stub detected, asking for a complete solution]");
                    }
                    messages.push(Message::assistant(&response));
                    messages.push(Message::user(&stub_feedback()));
                }
                Outcome::HardFailure => {
                    if progress {
                        eprintln!("solve[verification failed, sending diagnostics back]");
                    }
                    messages.push(Message::assistant(&response));
                    messages.push(Message::user(&failure_feedback(&last_result)));
                }
            }
        }

        if progress {
            eprintln!(
                "solve[budget exhausted after {} attempts, returning last pair]",
                self.max_retries
            );
        }
        Ok(SolveResult {
            code: pair.code,
            proof: pair.proof,
            verified: false,
            attempts: self.max_retries,
            last_result,
        })
    }
}
