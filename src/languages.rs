//! Language toolchain adapter.
//!
//! Maps the closed set of supported languages to compile/run command
//! sequences. The table itself is embedded from `files/languages.toml`
//! and loaded once at startup; the `Language` enum is the only way in,
//! so an unsupported identifier fails before anything executes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Supported languages. Deserialization of anything else fails, which
/// aborts the job before any execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[serde(alias = "py", alias = "python3")]
    Python,
    #[serde(alias = "js", alias = "node")]
    Javascript,
    #[serde(alias = "c++", alias = "g++")]
    Cpp,
    Java,
}

impl Language {
    fn key(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Cpp => "cpp",
            Language::Java => "java",
        }
    }

    const ALL: [Language; 4] = [
        Language::Python,
        Language::Javascript,
        Language::Cpp,
        Language::Java,
    ];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Compile step for a language that needs one: argv, working directory
/// and the artifact the compiler is expected to leave behind.
#[derive(Debug, Clone)]
pub struct CompileSpec {
    pub argv: Vec<String>,
    pub dir: PathBuf,
    pub artifact: Option<String>,
}

/// How to execute one test case: argv run with the test input on stdin.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub argv: Vec<String>,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Toolchain entry for one language.
#[derive(Debug, Clone)]
pub struct LanguageSpec {
    /// Name of the source file inside the scratch dir (e.g. "main.cpp").
    pub source_file: String,
    compile_command: Option<Vec<String>>,
    run_command: Vec<String>,
    artifact: Option<String>,
    /// (multiplier, bonus_seconds) applied to the base time limit.
    time_limit: Option<(u64, u64)>,
    /// (multiplier, bonus_mb) applied to the base memory limit.
    memory_limit: Option<(u64, u64)>,
}

impl LanguageSpec {
    /// Compile step, or `None` for interpreted languages.
    pub fn compile_spec(&self, dir: &Path) -> Option<CompileSpec> {
        self.compile_command.as_ref().map(|argv| CompileSpec {
            argv: argv.clone(),
            dir: dir.to_path_buf(),
            artifact: self.artifact.clone(),
        })
    }

    /// Run step for one test case.
    pub fn run_spec(&self, dir: &Path) -> RunSpec {
        RunSpec {
            argv: self.run_command.clone(),
            dir: dir.to_path_buf(),
            env: Vec::new(),
        }
    }

    /// Adjusted time limit in ms: `base * multiplier + bonus_seconds`.
    pub fn adjusted_time_ms(&self, base_ms: u64) -> u64 {
        match self.time_limit {
            Some((multiplier, bonus_secs)) => base_ms * multiplier + bonus_secs * 1000,
            None => base_ms,
        }
    }

    /// Adjusted memory limit in KB: `base * multiplier + bonus_mb`.
    pub fn adjusted_memory_kb(&self, base_kb: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_kb * multiplier + bonus_mb * 1024,
            None => base_kb,
        }
    }
}

/// Raw TOML entry before parsing command strings into argv lists.
#[derive(Debug, Deserialize)]
struct RawSpec {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    artifact: Option<String>,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
}

static LANGUAGES: OnceLock<HashMap<Language, LanguageSpec>> = OnceLock::new();

/// Load the embedded language table. Idempotent; call once at startup.
pub fn init_languages() -> anyhow::Result<()> {
    if LANGUAGES.get().is_some() {
        return Ok(());
    }
    let table = parse_table(include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/files/languages.toml"
    )))?;
    // A racing initializer loaded the same embedded table.
    let _ = LANGUAGES.set(table);
    Ok(())
}

/// Toolchain entry for a language, `None` if the table was never loaded.
pub fn spec(language: Language) -> Option<&'static LanguageSpec> {
    LANGUAGES.get()?.get(&language)
}

fn parse_table(content: &str) -> anyhow::Result<HashMap<Language, LanguageSpec>> {
    let raw: HashMap<String, RawSpec> =
        toml::from_str(content).context("invalid languages.toml")?;

    let mut table = HashMap::new();
    for (name, raw) in raw {
        let language = Language::ALL
            .into_iter()
            .find(|l| l.key() == name)
            .with_context(|| format!("unknown language in table: {}", name))?;

        let parse_limit = |values: &[String], kind: &str| -> anyhow::Result<Option<(u64, u64)>> {
            if values.is_empty() {
                return Ok(None);
            }
            if values.len() != 2 {
                anyhow::bail!("invalid {} limit for {}: {:?}", kind, name, values);
            }
            let multiplier = values[0]
                .parse::<u64>()
                .with_context(|| format!("invalid {} multiplier for {}", kind, name))?;
            let bonus = values[1]
                .parse::<u64>()
                .with_context(|| format!("invalid {} bonus for {}", kind, name))?;
            Ok(Some((multiplier, bonus)))
        };

        table.insert(
            language,
            LanguageSpec {
                source_file: raw.source_file,
                compile_command: raw.compile_command.as_deref().map(into_argv),
                run_command: into_argv(&raw.run_command),
                artifact: raw.artifact,
                time_limit: parse_limit(&raw.time_limit, "time")?,
                memory_limit: parse_limit(&raw.memory_limit, "memory")?,
            },
        );
    }

    for language in Language::ALL {
        if !table.contains_key(&language) {
            anyhow::bail!("language table is missing an entry for {}", language);
        }
    }

    Ok(table)
}

fn into_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> HashMap<Language, LanguageSpec> {
        parse_table(include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/files/languages.toml"
        )))
        .unwrap()
    }

    #[test]
    fn embedded_table_covers_every_language() {
        let table = table();
        for language in Language::ALL {
            assert!(table.contains_key(&language), "missing {}", language);
        }
    }

    #[test]
    fn interpreted_languages_have_no_compile_step() {
        let table = table();
        let dir = Path::new("/tmp/scratch");
        assert!(table[&Language::Python].compile_spec(dir).is_none());
        assert!(table[&Language::Cpp].compile_spec(dir).is_some());
    }

    #[test]
    fn run_spec_is_structured_argv() {
        let table = table();
        let spec = table[&Language::Python].run_spec(Path::new("/w"));
        assert_eq!(spec.argv, vec!["python3", "main.py"]);
        assert_eq!(spec.dir, Path::new("/w"));
    }

    #[test]
    fn limit_adjustments() {
        let table = table();
        let java = &table[&Language::Java];
        assert_eq!(java.adjusted_time_ms(1000), 3000);
        assert_eq!(java.adjusted_memory_kb(262_144), 540_672);

        let python = &table[&Language::Python];
        assert_eq!(python.adjusted_time_ms(1000), 1000);
    }

    #[test]
    fn unknown_language_identifier_is_rejected() {
        assert!(serde_json::from_str::<Language>("\"cpp\"").is_ok());
        assert!(serde_json::from_str::<Language>("\"py\"").is_ok());
        assert!(serde_json::from_str::<Language>("\"brainfuck\"").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        init_languages().unwrap();
        init_languages().unwrap();
        assert!(spec(Language::Cpp).is_some());
    }
}
