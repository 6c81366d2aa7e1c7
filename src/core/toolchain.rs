//! Language identifiers and the build/run recipe for each of them.
//!
//! The language set is closed: every variant of [`Language`] has a default
//! [`Toolchain`], and configuration may only override the recipe of a known
//! language, never add a new one.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use itertools::Itertools;

use crate::config::{ConfigError, ToolchainOverride};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    Python3,
    C,
    Cpp,
    Java,
    JavaScript,
    Ruby,
    Go,
    Bash,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python3,
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::JavaScript,
        Language::Ruby,
        Language::Go,
        Language::Bash,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Language::Python3 => "python3",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::JavaScript => "javascript",
            Language::Ruby => "ruby",
            Language::Go => "go",
            Language::Bash => "bash",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Language::Python3 => &["python", "py"],
            Language::C => &[],
            Language::Cpp => &["c++", "cxx"],
            Language::Java => &[],
            Language::JavaScript => &["js", "node"],
            Language::Ruby => &["rb"],
            Language::Go => &["golang"],
            Language::Bash => &["sh"],
        }
    }

    /// Case-insensitive match on the id or one of the aliases.
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|lang| lang.id() == id || lang.aliases().contains(&id.as_str()))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// Expands to the main source file name.
const SOURCE: &str = "{source}";
/// Expands to every submitted file name, one argument each.
const SOURCES: &str = "{sources}";
/// Expands to the main source file name without its extension.
const ENTRY: &str = "{entry}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toolchain {
    pub image: String,
    pub source_file: String,
    pub build: Option<Vec<String>>,
    pub run: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Toolchain {
    pub fn is_compiled(&self) -> bool {
        self.build.is_some()
    }

    pub fn entry(&self) -> &str {
        Path::new(&self.source_file)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.source_file)
    }

    pub fn build_command(&self, sources: &[String]) -> Option<Vec<String>> {
        self.build
            .as_ref()
            .map(|template| self.expand(template, sources))
    }

    pub fn run_command(&self, sources: &[String]) -> Vec<String> {
        self.expand(&self.run, sources)
    }

    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    fn expand(&self, template: &[String], sources: &[String]) -> Vec<String> {
        template
            .iter()
            .flat_map(|arg| match arg.as_str() {
                SOURCES if sources.is_empty() => vec![self.source_file.clone()],
                SOURCES => sources.to_vec(),
                _ => vec![
                    arg.replace(SOURCE, &self.source_file)
                        .replace(ENTRY, self.entry()),
                ],
            })
            .collect()
    }

    fn with_override(mut self, over: &ToolchainOverride) -> Self {
        if let Some(image) = &over.image {
            self.image = image.clone();
        }
        if let Some(build) = &over.build {
            self.build = (!build.is_empty()).then(|| build.clone());
        }
        if let Some(run) = &over.run {
            self.run = run.clone();
        }
        self
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn env(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn default_toolchain(language: Language) -> Toolchain {
    let home = [("HOME", "/sandbox")];
    match language {
        Language::Python3 => Toolchain {
            image: "python:3.12-slim".to_string(),
            source_file: "main.py".to_string(),
            build: None,
            run: args(&["python3", SOURCE]),
            env: env(&[home[0], ("PYTHONDONTWRITEBYTECODE", "1")]),
        },
        Language::C => Toolchain {
            image: "gcc:14".to_string(),
            source_file: "main.c".to_string(),
            build: Some(args(&[
                "gcc", "-O2", "-std=c17", "-o", "main", SOURCES, "-lm",
            ])),
            run: args(&["./main"]),
            env: env(&home),
        },
        Language::Cpp => Toolchain {
            image: "gcc:14".to_string(),
            source_file: "main.cpp".to_string(),
            build: Some(args(&["g++", "-O2", "-std=c++17", "-o", "main", SOURCES])),
            run: args(&["./main"]),
            env: env(&home),
        },
        Language::Java => Toolchain {
            image: "eclipse-temurin:21-jdk".to_string(),
            source_file: "Main.java".to_string(),
            build: Some(args(&["javac", "-encoding", "UTF-8", "-d", ".", SOURCES])),
            run: args(&["java", "-XX:+UseSerialGC", "-cp", ".", ENTRY]),
            env: env(&home),
        },
        Language::JavaScript => Toolchain {
            image: "node:22-slim".to_string(),
            source_file: "main.js".to_string(),
            build: None,
            run: args(&["node", SOURCE]),
            env: env(&home),
        },
        Language::Ruby => Toolchain {
            image: "ruby:3.3-slim".to_string(),
            source_file: "main.rb".to_string(),
            build: None,
            run: args(&["ruby", SOURCE]),
            env: env(&home),
        },
        Language::Go => Toolchain {
            image: "golang:1.23".to_string(),
            source_file: "main.go".to_string(),
            build: Some(args(&["go", "build", "-o", "main", SOURCES])),
            run: args(&["./main"]),
            env: env(&[
                home[0],
                ("GOCACHE", "/sandbox/.cache/go-build"),
                ("GOPATH", "/sandbox/go"),
                ("GOTMPDIR", "/sandbox"),
                ("GOTOOLCHAIN", "local"),
                ("GO111MODULE", "off"),
            ]),
        },
        Language::Bash => Toolchain {
            image: "bash:5.2".to_string(),
            source_file: "main.sh".to_string(),
            build: None,
            run: args(&["bash", SOURCE]),
            env: env(&home),
        },
    }
}

/// Read-only after construction; shared behind an `Arc` by every submission.
#[derive(Clone, Debug)]
pub struct ToolchainRegistry {
    entries: HashMap<Language, Arc<Toolchain>>,
}

impl ToolchainRegistry {
    pub fn new(overrides: &HashMap<String, ToolchainOverride>) -> Result<Self, ConfigError> {
        let mut entries: HashMap<Language, Arc<Toolchain>> = Language::ALL
            .into_iter()
            .map(|lang| (lang, Arc::new(default_toolchain(lang))))
            .collect();

        for (id, over) in overrides {
            let lang =
                Language::from_id(id).ok_or_else(|| ConfigError::UnknownLanguage(id.clone()))?;
            let toolchain = default_toolchain(lang).with_override(over);
            tracing::info!(language = %lang, image = %toolchain.image, "Toolchain overridden");
            entries.insert(lang, Arc::new(toolchain));
        }

        Ok(Self { entries })
    }

    pub fn lookup(&self, id: &str) -> Result<(Language, Arc<Toolchain>), LookupError> {
        Language::from_id(id)
            .and_then(|lang| self.entries.get(&lang).map(|tc| (lang, tc.clone())))
            .ok_or_else(|| LookupError::UnsupportedLanguage(id.to_string()))
    }

    /// Every language with its toolchain, in a stable order.
    pub fn languages(&self) -> Vec<(Language, Arc<Toolchain>)> {
        self.entries
            .iter()
            .map(|(lang, tc)| (*lang, tc.clone()))
            .sorted_by_key(|(lang, _)| *lang)
            .collect()
    }
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        Self {
            entries: Language::ALL
                .into_iter()
                .map(|lang| (lang, Arc::new(default_toolchain(lang))))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive_and_follows_aliases() {
        let registry = ToolchainRegistry::default();

        for (id, expected) in [
            ("python3", Language::Python3),
            ("Python", Language::Python3),
            (" py ", Language::Python3),
            ("C", Language::C),
            ("c++", Language::Cpp),
            ("JS", Language::JavaScript),
            ("golang", Language::Go),
            ("sh", Language::Bash),
        ] {
            let (lang, _) = registry.lookup(id).unwrap();
            assert_eq!(lang, expected, "id {id:?}");
        }
    }

    #[test]
    fn test_unknown_language_is_rejected() {
        let registry = ToolchainRegistry::default();
        assert_eq!(
            registry.lookup("brainfuck").unwrap_err(),
            LookupError::UnsupportedLanguage("brainfuck".to_string())
        );
        assert!(registry.lookup("").is_err());
    }

    #[test]
    fn test_every_language_has_a_toolchain() {
        let registry = ToolchainRegistry::default();
        let languages = registry.languages();

        assert_eq!(languages.len(), Language::ALL.len());
        assert_eq!(languages[0].0, Language::Python3);
        for (lang, toolchain) in languages {
            assert!(!toolchain.run.is_empty(), "{lang} has no run command");
            assert!(!toolchain.image.is_empty(), "{lang} has no image");
        }
    }

    #[test]
    fn test_compiled_languages() {
        let registry = ToolchainRegistry::default();
        let compiled: Vec<Language> = registry
            .languages()
            .into_iter()
            .filter(|(_, tc)| tc.is_compiled())
            .map(|(lang, _)| lang)
            .collect();

        assert_eq!(
            compiled,
            vec![Language::C, Language::Cpp, Language::Java, Language::Go]
        );
    }

    #[test]
    fn test_template_expansion() {
        let java = default_toolchain(Language::Java);
        let sources = vec!["Main.java".to_string(), "Helper.java".to_string()];

        assert_eq!(
            java.build_command(&sources).unwrap(),
            args(&["javac", "-encoding", "UTF-8", "-d", ".", "Main.java", "Helper.java"])
        );
        assert_eq!(
            java.run_command(&sources),
            args(&["java", "-XX:+UseSerialGC", "-cp", ".", "Main"])
        );

        let python = default_toolchain(Language::Python3);
        assert_eq!(python.build_command(&[]), None);
        assert_eq!(python.run_command(&[]), args(&["python3", "main.py"]));
    }

    #[test]
    fn test_override_replaces_recipe_parts() {
        let overrides = HashMap::from([
            (
                "python".to_string(),
                ToolchainOverride {
                    image: Some("python:3.11-alpine".to_string()),
                    ..Default::default()
                },
            ),
            (
                "c".to_string(),
                ToolchainOverride {
                    build: Some(vec![]),
                    run: Some(args(&["tcc", "-run", SOURCE])),
                    ..Default::default()
                },
            ),
        ]);
        let registry = ToolchainRegistry::new(&overrides).unwrap();

        let (_, python) = registry.lookup("python3").unwrap();
        assert_eq!(python.image, "python:3.11-alpine");
        assert_eq!(python.run, default_toolchain(Language::Python3).run);

        let (_, c) = registry.lookup("c").unwrap();
        assert!(!c.is_compiled());
        assert_eq!(c.run_command(&[]), args(&["tcc", "-run", "main.c"]));
    }

    #[test]
    fn test_override_for_unknown_language_fails() {
        let overrides = HashMap::from([("cobol".to_string(), ToolchainOverride::default())]);
        assert!(matches!(
            ToolchainRegistry::new(&overrides),
            Err(ConfigError::UnknownLanguage(_))
        ));
    }
}
