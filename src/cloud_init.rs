//! cloud-init documents pushed to a node during bootstrap.
//!
//! The operator's user-data file is loaded once and extended in memory; the
//! file on disk is never rewritten.

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::fabric::models::Resource;
use crate::logging::redact;

const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
const WRITE_FILE_PERMISSIONS: &str = "0644";

/// GPU models that get size labels, keyed by every accepted spelling.
const ALLOWED_GPUS: &[(&str, &str)] = &[
    ("nvidia-a100-40g", "nvidia-a100-40g"),
    ("nvidia-a100-80g", "nvidia-a100-80g"),
    ("nvidia-h100", "nvidia-h100"),
    ("a100-40g", "nvidia-a100-40g"),
    ("a100-80g", "nvidia-a100-80g"),
    ("h100", "nvidia-h100"),
];

/// An entry for the cloud-config `write_files` module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
}

impl WriteFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    fn to_yaml(&self) -> Value {
        let mut entry = Mapping::new();
        entry.insert("encoding".into(), "b64".into());
        entry.insert("content".into(), STANDARD.encode(&self.content).into());
        entry.insert("permissions".into(), WRITE_FILE_PERMISSIONS.into());
        entry.insert("path".into(), self.path.clone().into());
        Value::Mapping(entry)
    }
}

pub trait ConfigBuilder {
    fn extend_startup_commands(&mut self, commands: &[String]) -> Result<()>;

    fn extend_startup_files(&mut self, files: &[WriteFile]) -> Result<()>;

    /// Shell script dropping a k3s/rke2 config fragment with the provider id
    /// and GPU node labels.
    fn render_provider_id_script(&self, config_name: &str, machine_uuid: &str) -> String;

    fn render_instance_metadata(&self, machine_uuid: &str, hostname: &str) -> String;

    /// The (extended) user-data document, if one was configured.
    fn user_data(&self) -> Result<Option<String>>;
}

pub struct StandardConfigBuilder {
    devices: Vec<Resource>,
    user_data: Option<Mapping>,
}

impl StandardConfigBuilder {
    pub fn new(devices: Vec<Resource>, user_data_file: Option<&Path>) -> Result<Self> {
        let user_data = user_data_file.map(load_user_data).transpose()?;
        Ok(Self { devices, user_data })
    }

    fn extend(&mut self, module: &str, items: Vec<Value>) -> Result<()> {
        let Some(doc) = self.user_data.as_mut() else {
            return Ok(());
        };

        match doc.get_mut(module) {
            None => {
                doc.insert(module.into(), Value::Sequence(items));
            }
            Some(Value::Sequence(existing)) => existing.extend(items),
            Some(_) => {
                return Err(DriverError::CloudConfig(format!(
                    "module {module} exists but is not a list"
                )))
            }
        }
        Ok(())
    }

    fn gpu_node_labels(&self) -> Option<String> {
        let mut labels = Vec::new();

        for res in self.devices.iter().filter(|r| r.res_type == "gpu") {
            let model = res
                .conditions()
                .iter()
                .find(|c| c.column == "model" && c.operator == "eq")
                .map(|c| c.value.as_str())
                .unwrap_or_default();

            let Some((_, full_model)) = ALLOWED_GPUS.iter().find(|(alias, _)| *alias == model)
            else {
                warn!(model, "skipping labels because GPU model is not allowed");
                continue;
            };

            let (min, max) = (res.min_resource_count, res.max_resource_count);
            if min > max {
                warn!(model = full_model, min, max, "invalid GPU config: min count above max");
                continue;
            }
            if min > 0 {
                labels.push(format!("cohdi.io/{full_model}-size-min={min}"));
            } else {
                warn!(model = full_model, "min_resource_count missing for GPU");
            }
            if max > 0 {
                labels.push(format!("cohdi.io/{full_model}-size-max={max}"));
            } else {
                warn!(model = full_model, "max_resource_count missing for GPU");
            }
        }

        if labels.is_empty() {
            debug!("no GPU labels generated");
            return None;
        }
        Some(format!(r#"kubelet-arg+: "node-labels={}""#, labels.join(",")))
    }
}

fn load_user_data(path: &Path) -> Result<Mapping> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DriverError::CloudConfig(format!("reading user data file {}: {e}", path.display()))
    })?;
    debug!(path = %path.display(), content = %redact(&raw), "loaded cloud config user data");

    match serde_yaml::from_str::<Value>(&raw) {
        Ok(Value::Mapping(doc)) => Ok(doc),
        Ok(Value::Null) => Ok(Mapping::new()),
        Ok(_) => Err(DriverError::CloudConfig(format!(
            "{} is not a cloud-config mapping",
            path.display()
        ))),
        Err(e) => Err(DriverError::CloudConfig(format!(
            "parsing {}: {e}",
            path.display()
        ))),
    }
}

impl ConfigBuilder for StandardConfigBuilder {
    fn extend_startup_commands(&mut self, commands: &[String]) -> Result<()> {
        let items = commands.iter().map(|c| Value::from(c.as_str())).collect();
        self.extend("runcmd", items)
    }

    fn extend_startup_files(&mut self, files: &[WriteFile]) -> Result<()> {
        let items = files.iter().map(WriteFile::to_yaml).collect();
        self.extend("write_files", items)
    }

    fn render_provider_id_script(&self, config_name: &str, machine_uuid: &str) -> String {
        let mut content = format!(r#"kubelet-arg+: "provider-id=fsas://{machine_uuid}""#);
        if let Some(labels) = self.gpu_node_labels() {
            content.push('\n');
            content.push_str(&labels);
        }

        format!(
            "#!/bin/sh\n\
             for d in k3s rke2; do\n\
             mkdir -p /etc/rancher/${{d}}/config.yaml.d\n\
             cat << EOF > /etc/rancher/${{d}}/config.yaml.d/{config_name}.yaml\n\
             {content}\n\
             EOF\n\
             done\n"
        )
    }

    fn render_instance_metadata(&self, machine_uuid: &str, hostname: &str) -> String {
        format!("dsmode: local\ninstance-id: {machine_uuid}\nhostname: {hostname}")
    }

    fn user_data(&self) -> Result<Option<String>> {
        let Some(doc) = &self.user_data else {
            return Ok(None);
        };
        let body = serde_yaml::to_string(doc)
            .map_err(|e| DriverError::CloudConfig(format!("serializing user data: {e}")))?;
        Ok(Some(format!("{CLOUD_CONFIG_HEADER}\n{}", body.trim())))
    }
}
