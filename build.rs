use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own Rust sources. Nothing outside of them is scanned.
const SOURCE_ROOTS: [&str; 3] = ["coverage", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// What a collector is looking for; decides the wording of the failure message.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenComment,
    UppercaseComment,
    AllowDeadCode,
}

impl Rule {
    fn headline(self) -> &'static str {
        match self {
            Rule::UnderscorePrefix => "underscore-prefixed variables",
            Rule::ForbiddenComment => "forbidden comment patterns",
            Rule::UppercaseComment => "comments with all uppercase alphabetic characters",
            Rule::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Rule::UnderscorePrefix => "\n⚠️ Underscore-prefixed variable names are not allowed in this project.\n   Either use the variable (removing the underscore) or remove it completely.\n".to_string(),
            Rule::ForbiddenComment => format!(
                "\n⚠️ Comments containing {} are STRICTLY FORBIDDEN in this project.\n   The '**' pattern is not allowed in regular comments (but is allowed in doc comments).\n   Please remove these patterns before committing.\n",
                FORBIDDEN_WORDS
                    .iter()
                    .map(|w| format!("'{w}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Rule::UppercaseComment => "\n⚠️ Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project.\n   STRONGLY CONSIDER deleting the comment completely.\n".to_string(),
            Rule::AllowDeadCode => "\n⚠️ #[allow(dead_code)] attributes are STRICTLY FORBIDDEN in this project.\n   Either use the code (removing the attribute) or remove it completely.\n".to_string(),
        }
    }
}

// Collects every matching line of one file that violates `rule`.
struct ViolationCollector {
    rule: Rule,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl ViolationCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.headline(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&self.rule.advice());
        Some(error_msg)
    }

    fn accepts(&self, line_text: &str) -> bool {
        match self.rule {
            Rule::UnderscorePrefix => {
                let is_pure_comment =
                    line_text.trim_start().starts_with("//") || line_text.contains("/*");
                // underscores between quotes belong to string literals
                let is_in_string = line_text
                    .split('"')
                    .enumerate()
                    .any(|(i, part)| i % 2 == 1 && part.contains('_'));
                !(is_pure_comment || is_in_string)
            }
            Rule::ForbiddenComment => {
                let names_forbidden_word = FORBIDDEN_WORDS.iter().any(|w| line_text.contains(w));
                // '**' is markdown emphasis inside doc comments
                names_forbidden_word || !is_doc_comment(line_text)
            }
            Rule::UppercaseComment => match comment_text(line_text) {
                Some(text) => {
                    let alpha_chars: Vec<char> =
                        text.chars().filter(|c| c.is_alphabetic()).collect();
                    !alpha_chars.is_empty() && alpha_chars.iter().all(|c| c.is_uppercase())
                }
                None => false,
            },
            Rule::AllowDeadCode => true,
        }
    }
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///") || line.trim_start().starts_with("//!")
}

// The text of a line comment or of the first block comment on the line.
fn comment_text(line_text: &str) -> Option<&str> {
    let trimmed = line_text.trim_start();
    if trimmed.starts_with("///") || trimmed.starts_with("//!") {
        Some(trimmed[3..].trim())
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        Some(rest.trim())
    } else if let Some(idx) = line_text.find("/*") {
        let rest = &line_text[idx + 2..];
        Some(match rest.find("*/") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        })
    } else {
        None
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
        .collect()
}

fn scan(rule: Rule, pattern: &str, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();
    for path in sources {
        let mut collector = ViolationCollector::new(rule, path);
        searcher.search_path(&matcher, path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn run_checks() -> Result<(), Box<dyn Error>> {
    let sources = rust_sources();
    for path in &sources {
        println!("cargo:rerun-if-changed={}", path.display());
    }

    scan(Rule::UnderscorePrefix, r"\b(_[a-zA-Z0-9_]+)\b", &sources)?;
    scan(
        Rule::ForbiddenComment,
        &format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
        &sources,
    )?;
    scan(Rule::ForbiddenComment, r"(//|/\*).*\*\*", &sources)?;
    scan(Rule::UppercaseComment, r"(//|/\*).*", &sources)?;
    scan(
        Rule::AllowDeadCode,
        r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        &sources,
    )?;
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    // `eprintln!` is what makes the message show up in cargo's output.
    if let Err(e) = run_checks() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
