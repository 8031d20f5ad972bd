//! The language registry: which image, commands and file extension each
//! supported language maps to. Written once at startup, read-only after.

use std::collections::HashMap;

use anyhow::{bail, Context};
use bollard::Docker;
use futures::future::try_join_all;

use crate::runner::image::pull_image;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    Interpreter,
    Compiler,
}

#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub name: String,
    pub image: String,
    /// File extension including the leading dot, e.g. `.py`.
    pub extension: String,
    pub kind: LanguageKind,
    /// Present iff `kind` is `Compiler`.
    pub compile_cmd: Option<Vec<String>>,
    pub execute_cmd: Vec<String>,
}

impl LanguageSpec {
    /// Parse one `name@image@extension@kind@cmd1[@cmd2]` entry.
    fn parse(entry: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = entry.split('@').collect();
        match fields.as_slice() {
            [name, image, extension, "interpreter", execute] => Ok(LanguageSpec {
                name: (*name).to_owned(),
                image: (*image).to_owned(),
                extension: (*extension).to_owned(),
                kind: LanguageKind::Interpreter,
                compile_cmd: None,
                execute_cmd: split_command(execute)?,
            }),
            [name, image, extension, "compiler", compile, execute] => Ok(LanguageSpec {
                name: (*name).to_owned(),
                image: (*image).to_owned(),
                extension: (*extension).to_owned(),
                kind: LanguageKind::Compiler,
                compile_cmd: Some(split_command(compile)?),
                execute_cmd: split_command(execute)?,
            }),
            [_, _, _, "interpreter" | "compiler", ..] => {
                bail!("wrong number of fields for this language kind")
            }
            [_, _, _, kind, ..] => bail!("unknown language kind {kind:?}"),
            _ => bail!("expected name@image@extension@kind@command"),
        }
    }
}

fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    let argv: Vec<String> = command.split_whitespace().map(str::to_owned).collect();
    if argv.is_empty() {
        bail!("empty command");
    }
    Ok(argv)
}

#[derive(Debug, Default)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageSpec>,
}

impl LanguageRegistry {
    /// Parse the comma-separated registry configuration. Malformed entries
    /// are fatal.
    pub fn parse(entries: &str) -> anyhow::Result<Self> {
        let mut languages = HashMap::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let spec = LanguageSpec::parse(entry)
                .with_context(|| format!("malformed language entry {entry:?}"))?;
            languages.insert(spec.name.clone(), spec);
        }
        if languages.is_empty() {
            bail!("no supported languages configured");
        }
        Ok(LanguageRegistry { languages })
    }

    pub fn get(&self, name: &str) -> Option<&LanguageSpec> {
        self.languages.get(name)
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }

    /// Pull every registered image in parallel, failing fast on the first
    /// pull error.
    pub async fn preload_images(&self, docker: &Docker) -> anyhow::Result<()> {
        try_join_all(
            self.languages
                .values()
                .map(|lang| pull_image(docker, &lang.image)),
        )
        .await?;
        Ok(())
    }
}
