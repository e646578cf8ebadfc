//! Generated artifacts: a well-formed subscription together with the projection of every role,
//! written to disk behind a header that marks the file as generated.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};

use crate::{
    composition::{
        compose_protocols, exact_well_formed_sub, overapproximated_well_formed_sub, project,
        composition_types::{Granularity, InterfacingProtocols, Projection},
    },
    types::Role,
    Error, Result, Subscriptions,
};

pub const HEADER: &str = "// @generated by swarm-conformance; do not edit";
pub const VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationConfig {
    /// `None` computes the exact subscription.
    pub granularity: Option<Granularity>,
    pub minimize: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            granularity: None,
            minimize: true,
        }
    }
}

impl GenerationConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub version: u32,
    pub generated_by: String,
    pub subscriptions: Subscriptions,
    pub projections: BTreeMap<Role, Projection>,
}

pub fn generate(
    protos: InterfacingProtocols,
    partial: &Subscriptions,
    config: &GenerationConfig,
) -> Result<Artifact> {
    let _span = tracing::info_span!("generate").entered();
    let subscriptions = match config.granularity {
        None => exact_well_formed_sub(protos.clone(), partial)?,
        Some(granularity) => {
            overapproximated_well_formed_sub(protos.clone(), partial, granularity)?
        }
    };
    let projections = compose_protocols(protos.clone())?
        .roles()
        .into_iter()
        .map(|role| {
            let projection = project(protos.clone(), &subscriptions, role.clone(), config.minimize)?;
            Ok((role, projection))
        })
        .collect::<Result<_>>()?;

    Ok(Artifact {
        version: VERSION,
        generated_by: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        subscriptions,
        projections,
    })
}

pub fn render(artifact: &Artifact) -> Result<String> {
    Ok(format!(
        "{HEADER}\n{}\n",
        serde_json::to_string_pretty(artifact)?
    ))
}

pub fn parse(text: &str) -> Result<Artifact> {
    let Some(body) = text.strip_prefix(HEADER) else {
        return Err(Error::InvalidArtifact("missing header".to_string()));
    };
    let artifact: Artifact = serde_json::from_str(body.trim_start())?;
    if artifact.version != VERSION {
        return Err(Error::InvalidArtifact(format!(
            "unsupported version {}",
            artifact.version
        )));
    }
    Ok(artifact)
}

/// Write `artifact` to `path`. An existing file is only replaced if it is itself generated.
pub fn write_artifact(path: &Path, artifact: &Artifact) -> Result<()> {
    if path.exists() && !fs::read_to_string(path)?.starts_with(HEADER) {
        tracing::warn!(path = %path.display(), "not overwriting hand-written file");
        return Err(Error::ForeignFile(path.to_path_buf()));
    }
    fs::write(path, render(artifact)?)?;
    tracing::info!(path = %path.display(), roles = artifact.projections.len(), "wrote artifact");
    Ok(())
}

pub fn load_artifact(path: &Path) -> Result<Artifact> {
    parse(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use tracing_subscriber::{fmt, fmt::format::FmtSpan, EnvFilter};

    fn setup_logger() {
        fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .try_init()
            .ok();
    }

    fn quality_protos() -> InterfacingProtocols {
        serde_json::from_str(
            r#"[
                { "initial": "0", "transitions": [
                    { "source": "0", "target": "1", "label": { "cmd": "close", "logType": ["closingTime"], "role": "D" } },
                    { "source": "0", "target": "1", "label": { "cmd": "accept", "logType": ["partOK"], "role": "D" } }
                ] },
                { "initial": "0", "transitions": [
                    { "source": "0", "target": "1", "label": { "cmd": "accept", "logType": ["partOK"], "role": "D" } },
                    { "source": "1", "target": "2", "label": { "cmd": "store", "logType": ["stored"], "role": "W" } }
                ] }
            ]"#,
        )
        .unwrap()
    }

    fn artifact() -> Artifact {
        generate(
            quality_protos(),
            &Subscriptions::new(),
            &GenerationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn generate_projects_every_role() {
        setup_logger();
        let artifact = artifact();
        assert_eq!(artifact.version, VERSION);
        assert_eq!(
            artifact.projections.keys().cloned().collect::<Vec<_>>(),
            vec![Role::new("D"), Role::new("W")]
        );
        assert!(artifact.subscriptions[&Role::new("D")].contains(&EventType::new("partOK")));
    }

    #[test]
    fn write_then_load() {
        setup_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.json");
        let artifact = artifact();

        write_artifact(&path, &artifact).unwrap();
        assert!(fs::read_to_string(&path).unwrap().starts_with(HEADER));
        assert_eq!(load_artifact(&path).unwrap(), artifact);

        // generated files may be regenerated
        write_artifact(&path, &artifact).unwrap();
        assert_eq!(load_artifact(&path).unwrap(), artifact);
    }

    #[test]
    fn foreign_files_are_kept() {
        setup_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quality.json");
        fs::write(&path, "{}").unwrap();

        let err = write_artifact(&path, &artifact()).unwrap_err();
        assert!(matches!(err, Error::ForeignFile(p) if p == path));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            parse("{}"),
            Err(Error::InvalidArtifact(msg)) if msg == "missing header"
        ));
        assert!(matches!(
            parse(&format!("{HEADER}\nnot json")),
            Err(Error::Parse(_))
        ));

        let mut text = render(&artifact()).unwrap();
        text = text.replace("\"version\": 1", "\"version\": 7");
        assert!(matches!(
            parse(&text),
            Err(Error::InvalidArtifact(msg)) if msg == "unsupported version 7"
        ));
    }

    #[test]
    fn config_from_json() {
        let config = GenerationConfig::from_json(r#"{ "granularity": "Coarse" }"#).unwrap();
        assert_eq!(config.granularity, Some(Granularity::Coarse));
        assert!(config.minimize);
        assert!(GenerationConfig::from_json(r#""coarse""#).is_err());
    }
}
