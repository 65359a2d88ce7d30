//! Persona loading and per-invocation selection.
//!
//! Each file in the persona directory is one persona; the file stem is its
//! name. Selection happens once per invocation and stays stable afterwards.

use std::path::Path;

use murmur_config::PersonaConfig;
use rand::seq::SliceRandom;

#[derive(Debug, Clone)]
pub struct Persona {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct PersonaStore {
    personas: Vec<Persona>,
    default_name: String,
    random_selection: bool,
    enabled: bool,
}

impl PersonaStore {
    pub fn load(dir: &Path, config: &PersonaConfig) -> Self {
        let mut personas = Vec::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let ext = path.extension().and_then(|e| e.to_str());
                    if !matches!(ext, Some("txt") | Some("md")) {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match std::fs::read_to_string(&path) {
                        Ok(prompt) if !prompt.trim().is_empty() => personas.push(Persona {
                            name: stem.to_string(),
                            prompt: prompt.trim().to_string(),
                        }),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("failed to read persona {}: {e}", path.display()),
                    }
                }
            }
            Err(e) => tracing::warn!("failed to read persona directory {}: {e}", dir.display()),
        }
        personas.sort_by(|a, b| a.name.cmp(&b.name));

        Self {
            personas,
            default_name: config.default_persona.clone(),
            random_selection: config.random_selection,
            enabled: config.enabled,
        }
    }

    pub fn empty() -> Self {
        Self {
            personas: Vec::new(),
            default_name: String::new(),
            random_selection: false,
            enabled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.name == name)
    }

    /// Pick the persona for a new invocation.
    pub fn choose(&self) -> Option<&Persona> {
        if !self.enabled || self.personas.is_empty() {
            return None;
        }
        if self.random_selection {
            return self.personas.choose(&mut rand::thread_rng());
        }
        self.get(&self.default_name).or_else(|| self.personas.first())
    }
}
