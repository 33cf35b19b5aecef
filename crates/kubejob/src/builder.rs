// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job construction and descriptor normalization.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job as JobDescriptor, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::error::JobError;
use crate::job::Job;
use crate::macros::setters;

/// Builds a [`Job`] from an image and command, or from a full descriptor
pub struct JobBuilder {
    cluster: Arc<dyn Cluster>,
    image: Option<String>,
    command: Vec<String>,
}

impl JobBuilder {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster, image: None, command: Vec::new() }
    }

    setters! {
        set { command: Vec<String> }
        option { image: String }
    }

    /// Single-container job running `command` in `image`
    pub fn build(self) -> Result<Job, JobError> {
        let image = self
            .image
            .clone()
            .filter(|image| !image.is_empty())
            .ok_or_else(|| JobError::InvalidJob("container image is required".into()))?;
        let container = Container {
            image: Some(image),
            command: Some(self.command.clone()).filter(|c| !c.is_empty()),
            ..Container::default()
        };
        let descriptor = JobDescriptor {
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec { containers: vec![container], ..PodSpec::default() }),
                },
                ..JobSpec::default()
            }),
            ..JobDescriptor::default()
        };
        self.build_with_job(descriptor)
    }

    /// Job from a caller-supplied descriptor, normalized for a run
    pub fn build_with_job(self, mut descriptor: JobDescriptor) -> Result<Job, JobError> {
        let label = normalize(&mut descriptor)?;
        Ok(Job::new(self.cluster, descriptor, label))
    }
}

fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// Fill in what a run relies on: a name, `restartPolicy: Never`, container
/// names, and a unique label that selects the job's pods.
///
/// Returns the label key; its value is the key itself.
pub(crate) fn normalize(descriptor: &mut JobDescriptor) -> Result<String, JobError> {
    let metadata = &mut descriptor.metadata;
    let named = metadata.name.as_deref().is_some_and(|n| !n.is_empty())
        || metadata.generate_name.as_deref().is_some_and(|n| !n.is_empty());
    if !named {
        metadata.name = Some(unique_name("kubejob"));
    }

    let template = &mut descriptor
        .spec
        .as_mut()
        .ok_or_else(|| JobError::InvalidJob("job has no spec".into()))?
        .template;
    let spec =
        template.spec.as_mut().ok_or_else(|| JobError::InvalidJob("job has no pod template spec".into()))?;
    if spec.containers.is_empty() {
        return Err(JobError::InvalidJob("job has no containers".into()));
    }
    if spec.restart_policy.as_deref().unwrap_or_default().is_empty() {
        spec.restart_policy = Some("Never".into());
    }
    for container in spec.init_containers.iter_mut().flatten().chain(spec.containers.iter_mut()) {
        if container.name.is_empty() {
            container.name = unique_name("kubejob-container");
        }
    }

    let label = unique_name("kubejob-label");
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(Default::default)
        .insert(label.clone(), label.clone());
    Ok(label)
}

#[cfg(test)]
#[path = "builder_tests.rs"]
mod tests;
