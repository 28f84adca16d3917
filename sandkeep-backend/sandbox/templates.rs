//! Built-in template catalog.
//!
//! A template selects the runtime image (Docker), language (Daytona) and the
//! ports a sandbox exposes. E2B resolves templates server-side and does not
//! consult this table.

use std::collections::BTreeMap;

use crate::sandbox::error::SandboxError;

pub const CODE_INTERPRETER: &str = "code-interpreter-v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDef {
    pub id: &'static str,
    pub docker_image: &'static str,
    /// Keep-alive command for images without a long-running default command.
    pub docker_command: Option<&'static [&'static str]>,
    pub daytona_language: &'static str,
    pub exposed_ports: &'static [u16],
    pub interpreter: bool,
}

const KEEP_ALIVE: &[&str] = &["sleep", "infinity"];

pub const CATALOG: &[TemplateDef] = &[
    TemplateDef {
        id: CODE_INTERPRETER,
        docker_image: "python:3.12-slim",
        docker_command: Some(KEEP_ALIVE),
        daytona_language: "python",
        exposed_ports: &[],
        interpreter: true,
    },
    TemplateDef {
        id: "nextjs-developer",
        docker_image: "sandkeep/nextjs-developer:latest",
        docker_command: None,
        daytona_language: "typescript",
        exposed_ports: &[3000],
        interpreter: false,
    },
    TemplateDef {
        id: "vue-developer",
        docker_image: "sandkeep/vue-developer:latest",
        docker_command: None,
        daytona_language: "typescript",
        exposed_ports: &[3000],
        interpreter: false,
    },
    TemplateDef {
        id: "streamlit-developer",
        docker_image: "sandkeep/streamlit-developer:latest",
        docker_command: None,
        daytona_language: "python",
        exposed_ports: &[8501],
        interpreter: false,
    },
    TemplateDef {
        id: "gradio-developer",
        docker_image: "sandkeep/gradio-developer:latest",
        docker_command: None,
        daytona_language: "python",
        exposed_ports: &[7860],
        interpreter: false,
    },
];

pub fn lookup(template: &str) -> Option<&'static TemplateDef> {
    CATALOG.iter().find(|t| t.id == template)
}

pub fn is_interpreter(template: &str) -> bool {
    lookup(template).is_some_and(|t| t.interpreter)
}

/// What the Docker backend runs for a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerTemplate {
    pub image: String,
    pub command: Option<Vec<String>>,
    pub exposed_ports: Vec<u16>,
    pub interpreter: bool,
}

/// Resolve a template for Docker: catalog entry, with the image replaced by
/// an override when one is configured. An override for an unknown template
/// makes it usable with the keep-alive command and no exposed ports.
pub fn resolve_docker(
    template: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<DockerTemplate, SandboxError> {
    match (lookup(template), overrides.get(template)) {
        (Some(def), image) => Ok(DockerTemplate {
            image: image.cloned().unwrap_or_else(|| def.docker_image.to_string()),
            command: def
                .docker_command
                .map(|cmd| cmd.iter().map(|s| s.to_string()).collect()),
            exposed_ports: def.exposed_ports.to_vec(),
            interpreter: def.interpreter,
        }),
        (None, Some(image)) => Ok(DockerTemplate {
            image: image.clone(),
            command: Some(KEEP_ALIVE.iter().map(|s| s.to_string()).collect()),
            exposed_ports: vec![],
            interpreter: false,
        }),
        (None, None) => Err(SandboxError::UnsupportedTemplate(template.to_string())),
    }
}

/// Daytona runs by language rather than by image.
pub fn daytona_language(template: &str) -> Result<&'static str, SandboxError> {
    lookup(template)
        .map(|t| t.daytona_language)
        .ok_or_else(|| SandboxError::UnsupportedTemplate(template.to_string()))
}

/// Parse `template=image,template=image` into an override map.
pub fn parse_image_overrides(raw: &str) -> Result<BTreeMap<String, String>, SandboxError> {
    let mut map = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (template, image) = pair
            .split_once('=')
            .map(|(t, i)| (t.trim(), i.trim()))
            .filter(|(t, i)| !t.is_empty() && !i.is_empty())
            .ok_or_else(|| SandboxError::Config(format!("invalid image override: {pair}")))?;
        map.insert(template.to_string(), image.to_string());
    }
    Ok(map)
}
