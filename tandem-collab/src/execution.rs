//! Running the shared buffer as code.
//!
//! The document itself only carries source text. Execution is a local,
//! per-user action behind the [`CodeRunner`] trait; [`execute`] adds the
//! policy around it (unsupported languages, time limit, empty output).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Default time limit for one run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const JAVASCRIPT_STARTER: &str = r#"// JavaScript - Click "Run" to execute
console.log("Hello, World!");

function fibonacci(n) {
  if (n <= 1) return n;
  return fibonacci(n - 1) + fibonacci(n - 2);
}

console.log("Fibonacci(10):", fibonacci(10));
"#;

const PYTHON_STARTER: &str = r#"# Python - Click "Run" to execute
print("Hello, World!")

def fibonacci(n):
    if n <= 1:
        return n
    return fibonacci(n - 1) + fibonacci(n - 2)

print("Fibonacci(10):", fibonacci(10))
"#;

const TYPESCRIPT_STARTER: &str = r#"// TypeScript - Syntax highlighting only
interface User {
  name: string;
  age: number;
}

const greet = (user: User): string => {
  return `Hello, ${user.name}!`;
};

console.log(greet({ name: "Alice", age: 30 }));
"#;

/// Languages a room can be edited in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    JavaScript,
    Python,
    TypeScript,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::JavaScript, Language::Python, Language::TypeScript];

    pub fn id(self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::TypeScript => "typescript",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.id() == id)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Language::JavaScript => "JavaScript",
            Language::Python => "Python",
            Language::TypeScript => "TypeScript",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Language::JavaScript => "js",
            Language::Python => "py",
            Language::TypeScript => "ts",
        }
    }

    /// Source a fresh buffer starts with.
    pub fn starter_source(self) -> &'static str {
        match self {
            Language::JavaScript => JAVASCRIPT_STARTER,
            Language::Python => PYTHON_STARTER,
            Language::TypeScript => TYPESCRIPT_STARTER,
        }
    }

    /// TypeScript is highlighted but never run.
    pub fn is_runnable(self) -> bool {
        matches!(self, Language::JavaScript | Language::Python)
    }

    /// Text to load when switching to `self` from a buffer holding `current`.
    ///
    /// Only untouched buffers (empty or still some language's starter) are
    /// replaced; user code is kept.
    pub fn switch_source(self, current: &str) -> Option<&'static str> {
        let untouched = current.is_empty()
            || Self::ALL.iter().any(|lang| lang.starter_source() == current);
        untouched.then(|| self.starter_source())
    }
}

/// Kind of one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Log,
    Error,
    Warn,
    /// Value of the final expression
    Result,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputLine {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self::new(OutputKind::Log, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, text)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Execution timed out ({}s limit)", .0.as_secs())]
    Timeout(Duration),
    #[error("runner failed: {0}")]
    Runner(String),
}

impl ExecutionError {
    /// The error as it is shown in an output pane.
    pub fn to_output_line(&self) -> OutputLine {
        OutputLine::error(self.to_string())
    }
}

/// Something that can run source code and capture its output.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, language: Language, source: &str) -> Result<Vec<OutputLine>, ExecutionError>;
}

/// Run `source` with `runner` under a time limit.
pub async fn execute(
    runner: &dyn CodeRunner,
    language: Language,
    source: &str,
    timeout: Duration,
) -> Result<Vec<OutputLine>, ExecutionError> {
    if !language.is_runnable() {
        return Ok(vec![OutputLine::new(
            OutputKind::Warn,
            format!(
                "Execution not supported for {}. Only JavaScript and Python can be run.",
                language.id()
            ),
        )]);
    }

    log::debug!("Running {} bytes of {}", source.len(), language.display_name());
    let lines = tokio::time::timeout(timeout, runner.run(language, source))
        .await
        .map_err(|_| ExecutionError::Timeout(timeout))??;

    if lines.is_empty() {
        return Ok(vec![OutputLine::log("(No output)")]);
    }
    Ok(lines)
}

/// Runs code with local interpreters in a child process.
///
/// stdout lines become `Log`, stderr lines become `Error`. The child is
/// killed if the run is cancelled (for example by the time limit).
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub node: String,
    pub python: String,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            node: "node".to_string(),
            python: "python3".to_string(),
        }
    }
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    async fn run(&self, language: Language, source: &str) -> Result<Vec<OutputLine>, ExecutionError> {
        let (program, flag) = match language {
            Language::JavaScript => (&self.node, "-e"),
            Language::Python => (&self.python, "-c"),
            Language::TypeScript => {
                return Err(ExecutionError::Runner("typescript is not runnable".to_string()))
            }
        };

        let output = Command::new(program)
            .arg(flag)
            .arg(source)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::Runner(format!("failed to start {program}: {e}")))?;

        let mut lines: Vec<OutputLine> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(OutputLine::log)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .filter(|line| !line.is_empty())
                .map(OutputLine::error),
        );
        if !output.status.success() && output.stderr.is_empty() {
            lines.push(OutputLine::error(format!("{program} exited with {}", output.status)));
        }
        Ok(lines)
    }
}
