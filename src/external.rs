//! External collaborator interfaces and their built-in implementations.
//!
//! The orchestrator core treats source validation, test synthesis, model
//! detection, and doc/improvement generation as named collaborators behind
//! traits, injected into the session controller at construction. The
//! built-in implementations here are deliberately small: a structural
//! (parse-only) validator, a key-format model detector, and template-based
//! generators. Swapping in networked implementations is a wiring change,
//! not a core change.

use async_trait::async_trait;
use regex::Regex;

use crate::protocol::{AiModel, Test, TestKind};

/// What structural validation learns about the submitted function.
///
/// This is the only thing the orchestrator ever extracts from user source;
/// beyond it, the source is an opaque blob.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    /// Parameter names, annotations and defaults stripped.
    pub params: Vec<String>,
}

/// Detects which AI model family an API key belongs to.
#[async_trait]
pub trait ModelDetector: Send + Sync {
    /// Returns the model the key maps to, or `None` for unknown keys.
    async fn detect_model(&self, api_key: &str) -> Option<AiModel>;

    /// Whether the key is usable for the given model.
    async fn test_connection(&self, model: AiModel, api_key: &str) -> bool;
}

/// Validates that submitted source is a single function definition.
pub trait SourceValidator: Send + Sync {
    /// Returns function metadata, or a human-readable rejection reason.
    fn validate(&self, source: &str) -> Result<FunctionInfo, String>;
}

/// Synthesizes runnable test source for one test kind.
#[async_trait]
pub trait TestSynthesizer: Send + Sync {
    fn kind(&self) -> TestKind;

    /// Returns freshly-minted pending tests. The emitted `source` strings
    /// are opaque to the orchestrator.
    async fn synthesize(&self, function: &FunctionInfo, source: &str)
    -> anyhow::Result<Vec<Test>>;
}

/// Generates reference documentation for a validated function.
#[async_trait]
pub trait DocGenerator: Send + Sync {
    async fn generate(
        &self,
        function: &FunctionInfo,
        api_key: &str,
        source: &str,
    ) -> anyhow::Result<String>;
}

/// Generates improvement suggestions for a validated function.
#[async_trait]
pub trait ImprovementGenerator: Send + Sync {
    async fn generate(
        &self,
        function: &FunctionInfo,
        api_key: &str,
        source: &str,
    ) -> anyhow::Result<Vec<String>>;
}

/// Model detector keyed on the well-known key formats of the supported
/// providers. No network round-trip.
pub struct KeyFormatDetector;

#[async_trait]
impl ModelDetector for KeyFormatDetector {
    async fn detect_model(&self, api_key: &str) -> Option<AiModel> {
        if api_key.starts_with("sk-ant-") {
            Some(AiModel::Sonnet)
        } else if api_key.starts_with("AIza") {
            Some(AiModel::Gemini)
        } else {
            None
        }
    }

    async fn test_connection(&self, model: AiModel, api_key: &str) -> bool {
        self.detect_model(api_key).await == Some(model)
    }
}

/// Parse-only validator: the source must contain exactly one top-level
/// `def` with an extractable name. Anything deeper is the sandbox
/// interpreter's job at execution time.
pub struct StructuralValidator {
    def_pattern: Regex,
}

impl StructuralValidator {
    pub fn new() -> Self {
        Self {
            // Top-level (column 0) function definitions only.
            def_pattern: Regex::new(r"(?m)^def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)")
                .unwrap(),
        }
    }
}

impl Default for StructuralValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceValidator for StructuralValidator {
    fn validate(&self, source: &str) -> Result<FunctionInfo, String> {
        if source.trim().is_empty() {
            return Err("source is empty".to_string());
        }

        let mut captures = self.def_pattern.captures_iter(source);
        let Some(first) = captures.next() else {
            return Err("no top-level function definition found".to_string());
        };
        if captures.next().is_some() {
            return Err("source must contain exactly one top-level function".to_string());
        }

        let name = first[1].to_string();
        let params = first[2]
            .split(',')
            .map(|p| {
                // Strip annotation and default: "x: int = 3" -> "x".
                p.split([':', '=']).next().unwrap_or("").trim().to_string()
            })
            .filter(|p| !p.is_empty() && p != "self")
            .collect();

        Ok(FunctionInfo { name, params })
    }
}

/// `test_add_smoke` -> `Add Smoke`.
fn title_for(test_name: &str) -> String {
    let stripped = test_name.strip_prefix("test_").unwrap_or(test_name);
    stripped
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn indent(code: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    code.lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Positional sample arguments for a call site. With no type information
/// available (the source is opaque beyond its signature), small integers
/// are the least surprising probe values.
fn sample_args(function: &FunctionInfo) -> String {
    function
        .params
        .iter()
        .map(|_| "1")
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_test(kind: TestKind, function: &FunctionInfo, synth_name: &str, body: String) -> Test {
    let name = format!("test_{}_{}", function.name, synth_name);
    let title = title_for(&name);
    Test::new(kind, name, title, body)
}

/// Template-based unit test synthesizer: a smoke test and a determinism
/// test around the embedded function source.
pub struct UnitTestSynthesizer;

#[async_trait]
impl TestSynthesizer for UnitTestSynthesizer {
    fn kind(&self) -> TestKind {
        TestKind::Unit
    }

    async fn synthesize(
        &self,
        function: &FunctionInfo,
        source: &str,
    ) -> anyhow::Result<Vec<Test>> {
        let args = sample_args(function);
        let name = &function.name;

        let smoke = format!(
            "def test_{name}_smoke():\n\
             \x20   \"\"\"Test that the function runs without crashing.\"\"\"\n\
             {}\n\
             \x20   result = {name}({args})\n\
             \x20   assert True\n\n\
             test_{name}_smoke()\n",
            indent(source, 4),
        );

        let deterministic = format!(
            "def test_{name}_deterministic():\n\
             \x20   \"\"\"Test that same input gives same output.\"\"\"\n\
             {}\n\
             \x20   result1 = {name}({args})\n\
             \x20   result2 = {name}({args})\n\
             \x20   assert result1 == result2\n\n\
             test_{name}_deterministic()\n",
            indent(source, 4),
        );

        Ok(vec![
            build_test(TestKind::Unit, function, "smoke", smoke),
            build_test(TestKind::Unit, function, "deterministic", deterministic),
        ])
    }
}

/// Memory test synthesizer: tracemalloc peak bound.
pub struct MemoryTestSynthesizer;

#[async_trait]
impl TestSynthesizer for MemoryTestSynthesizer {
    fn kind(&self) -> TestKind {
        TestKind::Memory
    }

    async fn synthesize(
        &self,
        function: &FunctionInfo,
        source: &str,
    ) -> anyhow::Result<Vec<Test>> {
        let args = sample_args(function);
        let name = &function.name;

        let body = format!(
            "import tracemalloc\n\n\
             def test_{name}_memory_usage():\n\
             \x20   \"\"\"Test memory usage of the function.\"\"\"\n\
             {}\n\
             \x20   tracemalloc.start()\n\
             \x20   try:\n\
             \x20       result = {name}({args})\n\
             \x20       current, peak = tracemalloc.get_traced_memory()\n\
             \x20       tracemalloc.stop()\n\
             \x20       assert peak < 100 * 1024 * 1024\n\
             \x20   except Exception:\n\
             \x20       tracemalloc.stop()\n\
             \x20       raise\n\n\
             test_{name}_memory_usage()\n",
            indent(source, 4),
        );

        Ok(vec![build_test(
            TestKind::Memory,
            function,
            "memory_usage",
            body,
        )])
    }
}

/// Performance test synthesizer: a timed call loop with a wall bound.
pub struct PerformanceTestSynthesizer;

#[async_trait]
impl TestSynthesizer for PerformanceTestSynthesizer {
    fn kind(&self) -> TestKind {
        TestKind::Performance
    }

    async fn synthesize(
        &self,
        function: &FunctionInfo,
        source: &str,
    ) -> anyhow::Result<Vec<Test>> {
        let args = sample_args(function);
        let name = &function.name;

        let body = format!(
            "import time\n\n\
             def test_{name}_performance():\n\
             \x20   \"\"\"Test performance of the function.\"\"\"\n\
             {}\n\
             \x20   start_time = time.time()\n\
             \x20   for _ in range(1000):\n\
             \x20       result = {name}({args})\n\
             \x20   assert time.time() - start_time < 10.0\n\n\
             test_{name}_performance()\n",
            indent(source, 4),
        );

        Ok(vec![build_test(
            TestKind::Performance,
            function,
            "performance",
            body,
        )])
    }
}

/// The standard synthesizer table, one entry per kind.
pub fn default_synthesizers() -> Vec<std::sync::Arc<dyn TestSynthesizer>> {
    vec![
        std::sync::Arc::new(UnitTestSynthesizer),
        std::sync::Arc::new(MemoryTestSynthesizer),
        std::sync::Arc::new(PerformanceTestSynthesizer),
    ]
}

/// Template documentation generator.
pub struct TemplateDocGenerator;

#[async_trait]
impl DocGenerator for TemplateDocGenerator {
    async fn generate(
        &self,
        function: &FunctionInfo,
        _api_key: &str,
        source: &str,
    ) -> anyhow::Result<String> {
        let params = if function.params.is_empty() {
            "This function takes no parameters.".to_string()
        } else {
            function
                .params
                .iter()
                .map(|p| format!("- `{p}`"))
                .collect::<Vec<_>>()
                .join("\n")
        };

        Ok(format!(
            "## `{name}({args})`\n\n### Parameters\n\n{params}\n\n### Source\n\n```python\n{source}```\n",
            name = function.name,
            args = function.params.join(", "),
        ))
    }
}

/// Heuristic improvement suggestions derived from the source shape.
pub struct TemplateImprovementGenerator;

#[async_trait]
impl ImprovementGenerator for TemplateImprovementGenerator {
    async fn generate(
        &self,
        function: &FunctionInfo,
        _api_key: &str,
        source: &str,
    ) -> anyhow::Result<Vec<String>> {
        let mut suggestions = Vec::new();

        if !source.contains("\"\"\"") && !source.contains("'''") {
            suggestions.push(format!(
                "Add a docstring to `{}` describing its behavior and return value.",
                function.name
            ));
        }
        if !source.contains("->") {
            suggestions.push("Add type annotations to the function signature.".to_string());
        }
        if source.contains("except:") {
            suggestions
                .push("Catch specific exception types instead of a bare `except:`.".to_string());
        }
        if source.lines().count() > 40 {
            suggestions.push(
                "Consider splitting the function into smaller helpers for readability."
                    .to_string(),
            );
        }
        if suggestions.is_empty() {
            suggestions.push("No structural issues detected.".to_string());
        }

        Ok(suggestions)
    }
}
