//! Plan phase: the single next object to create
//!
//! Provisioning is strictly ordered: size discovery, then storage, then the
//! download. Only the earliest outstanding stage's object is ever returned,
//! and nothing that already exists is returned again.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use stowage_common::crd::{Artifact, RuntimeConfigCommon};
use stowage_common::Result;

use crate::job::{build_check_size_job, build_download_job, TaskImages};
use crate::names::ArtifactNames;
use crate::observe::{Observation, StorageState, TaskState};
use crate::pvc::build_cache_pvc;

/// Provisioning stage whose object is missing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Size unknown and no check-size Job exists
    DiscoverSize,
    /// Size known and no PVC exists
    ProvisionStorage,
    /// PVC usable and no download Job exists or ever completed
    Download,
}

/// An object the driver should create
#[derive(Clone, Debug, PartialEq)]
pub enum PlannedObject {
    /// Size-discovery Job
    CheckSizeJob(Job),
    /// Cache PVC
    Pvc(PersistentVolumeClaim),
    /// Download Job
    DownloadJob(Job),
}

impl PlannedObject {
    /// Human-readable kind for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckSizeJob(_) => "check-size Job",
            Self::Pvc(_) => "PersistentVolumeClaim",
            Self::DownloadJob(_) => "download Job",
        }
    }

    /// Name of the object
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::CheckSizeJob(job) | Self::DownloadJob(job) => job.metadata.name.as_deref(),
            Self::Pvc(pvc) => pvc.metadata.name.as_deref(),
        }
    }
}

/// True when a download Job may be created on the current storage
pub fn can_create_download(obs: &Observation) -> bool {
    obs.storage_ready() || obs.storage_pending_wait_for_first_consumer()
}

/// The earliest stage whose object is missing, if any.
///
/// Later stages are never considered while an earlier one is outstanding,
/// even when the earlier object exists but has not finished.
pub fn next_stage(obs: &Observation) -> Option<Stage> {
    if !obs.size_known() {
        return (obs.check_size_fetched && obs.check_size == TaskState::Absent)
            .then_some(Stage::DiscoverSize);
    }

    if obs.storage == StorageState::Absent {
        return Some(Stage::ProvisionStorage);
    }

    let download_needed = obs.download_absent() && obs.completed_at.is_none();
    (download_needed && can_create_download(obs)).then_some(Stage::Download)
}

/// Build the object for the next stage
pub fn plan(
    artifact: &Artifact,
    obs: &Observation,
    names: &ArtifactNames,
    config: &RuntimeConfigCommon,
    images: &TaskImages,
) -> Result<Option<PlannedObject>> {
    let Some(stage) = next_stage(obs) else {
        return Ok(None);
    };
    let object = match stage {
        Stage::DiscoverSize if !config.auto_discovery() => return Ok(None),
        Stage::DiscoverSize => PlannedObject::CheckSizeJob(build_check_size_job(
            artifact,
            &names.check_size_job,
            config,
            images,
        )?),
        Stage::ProvisionStorage => {
            let size = obs.effective_size().unwrap_or_default();
            PlannedObject::Pvc(build_cache_pvc(
                artifact,
                &names.pvc,
                size,
                config.pvc_headroom_percent(),
                config.storage_class_name(),
            )?)
        }
        Stage::Download => PlannedObject::DownloadJob(build_download_job(
            artifact,
            &names.download_job,
            &names.pvc,
            obs.effective_size().unwrap_or_default(),
            config,
            images,
        )?),
    };
    Ok(Some(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::SizeSource;
    use crate::pvc::pvc_requested_storage;
    use chrono::Utc;
    use stowage_common::crd::{ArtifactSpec, ModelConfig};

    const GI: i64 = 1 << 30;

    fn artifact() -> Artifact {
        let mut a = Artifact::new(
            "llama",
            ArtifactSpec {
                source_uri: "hf://org/llama".to_string(),
                ..Default::default()
            },
        );
        a.metadata.namespace = Some("models".to_string());
        a.metadata.uid = Some("uid-1".to_string());
        a
    }

    fn obs() -> Observation {
        Observation {
            size: Some(SizeSource::Declared(10 * GI)),
            newly_discovered_size: None,
            size_output_error: None,
            check_size: TaskState::Absent,
            check_size_fetched: false,
            storage: StorageState::Absent,
            pvc: None,
            download: TaskState::Absent,
            completed_at: None,
            progress: None,
            failure_detail: None,
        }
    }

    fn unknown_size() -> Observation {
        Observation {
            size: None,
            check_size_fetched: true,
            ..obs()
        }
    }

    fn run(o: &Observation) -> Option<PlannedObject> {
        let a = artifact();
        let names = ArtifactNames::for_artifact(&a).unwrap();
        plan(
            &a,
            o,
            &names,
            &RuntimeConfigCommon::system_defaults(),
            &TaskImages::default(),
        )
        .unwrap()
    }

    #[test]
    fn unknown_size_plans_check_size_job_only() {
        let planned = run(&unknown_size()).unwrap();
        assert!(matches!(planned, PlannedObject::CheckSizeJob(_)));
        assert!(planned.name().unwrap().starts_with("llama-check-size-"));
    }

    #[test]
    fn disabled_discovery_plans_nothing() {
        let a = artifact();
        let names = ArtifactNames::for_artifact(&a).unwrap();
        let config = RuntimeConfigCommon {
            model: Some(ModelConfig {
                auto_discovery: Some(false),
            }),
            ..RuntimeConfigCommon::system_defaults()
        };
        let planned = plan(&a, &unknown_size(), &names, &config, &TaskImages::default()).unwrap();
        assert!(planned.is_none());
    }

    #[test]
    fn existing_check_size_job_blocks_everything() {
        for state in [TaskState::Running, TaskState::Succeeded, TaskState::Failed] {
            let o = Observation {
                check_size: state,
                ..unknown_size()
            };
            assert_eq!(next_stage(&o), None, "{state:?}");
        }
    }

    #[test]
    fn known_size_without_pvc_plans_pvc_with_headroom() {
        let Some(PlannedObject::Pvc(pvc)) = run(&obs()) else {
            panic!("expected a PVC");
        };
        let request = pvc_requested_storage(&pvc).unwrap();
        assert_eq!(request.0, (11 * GI).to_string());
    }

    #[test]
    fn bound_storage_plans_download_job() {
        let o = Observation {
            storage: StorageState::Bound,
            ..obs()
        };
        assert!(matches!(run(&o), Some(PlannedObject::DownloadJob(_))));
    }

    #[test]
    fn wait_for_first_consumer_allows_download_job() {
        let o = Observation {
            storage: StorageState::Pending {
                wait_for_first_consumer: true,
            },
            ..obs()
        };
        assert_eq!(next_stage(&o), Some(Stage::Download));

        let o = Observation {
            storage: StorageState::Pending {
                wait_for_first_consumer: false,
            },
            ..obs()
        };
        assert_eq!(next_stage(&o), None);
    }

    #[test]
    fn lost_storage_plans_nothing() {
        let o = Observation {
            storage: StorageState::Lost,
            ..obs()
        };
        assert_eq!(next_stage(&o), None);
    }

    #[test]
    fn existing_objects_are_never_planned_again() {
        for download in [TaskState::Running, TaskState::Succeeded, TaskState::Failed] {
            let o = Observation {
                storage: StorageState::Bound,
                download,
                ..obs()
            };
            assert_eq!(next_stage(&o), None, "{download:?}");
        }
    }

    #[test]
    fn completed_download_is_not_recreated_after_cleanup() {
        let o = Observation {
            storage: StorageState::Bound,
            completed_at: Some(Utc::now()),
            ..obs()
        };
        assert_eq!(next_stage(&o), None);
    }

    #[test]
    fn at_most_one_object_is_planned_for_every_state() {
        let storages = [
            StorageState::Absent,
            StorageState::Pending {
                wait_for_first_consumer: true,
            },
            StorageState::Bound,
            StorageState::Lost,
        ];
        let tasks = [
            TaskState::Absent,
            TaskState::Running,
            TaskState::Succeeded,
            TaskState::Failed,
        ];
        for size in [None, Some(SizeSource::Declared(GI))] {
            for storage in &storages {
                for download in tasks {
                    let o = Observation {
                        size,
                        check_size_fetched: size.is_none(),
                        storage: storage.clone(),
                        download,
                        ..obs()
                    };
                    let stage = next_stage(&o);
                    if size.is_none() {
                        assert_eq!(stage, Some(Stage::DiscoverSize));
                    } else if *storage == StorageState::Absent {
                        assert_eq!(stage, Some(Stage::ProvisionStorage));
                    } else if download != TaskState::Absent {
                        assert_eq!(stage, None);
                    }
                }
            }
        }
    }
}
