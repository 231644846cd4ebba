// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use indexmap::IndexMap;
use log::debug;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::application::Principal;
use crate::config::{Configuration, FilesystemConfig, SchedulerConfig};
use crate::fs::grid::GridFs;
use crate::fs::local::LocalFs;
use crate::fs::sftp::SftpFs;
use crate::fs::Filesystem;
use crate::scheduler::grid::GridScheduler;
use crate::scheduler::memory::MemoryScheduler;
use crate::scheduler::queue::QueueScheduler;
use crate::scheduler::slurm::SlurmScheduler;
use crate::scheduler::Scheduler;
use crate::ssh::SshPool;
use crate::Error;

/// A named pairing of one scheduler and one filesystem.
///
/// Opaque to the orchestrator, which depends only on the two capability
/// contracts.
pub struct Destination {
    pub name: String,
    pub scheduler: Arc<dyn Scheduler>,
    pub filesystem: Arc<dyn Filesystem>,
}

/// Construct concrete scheduler and filesystem instances for every
/// configured destination, preserving configuration order.
///
/// Must run inside the async runtime: the memory scheduler spawns its
/// worker pool on construction.
pub fn build_destinations(
    configuration: &Configuration,
) -> Result<IndexMap<String, Destination>, Error> {
    let mut destinations = IndexMap::new();

    for (name, destination) in &configuration.destinations {
        let scheduler: Arc<dyn Scheduler> = match &destination.scheduler {
            SchedulerConfig::Memory { slots } => Arc::new(MemoryScheduler::new(*slots)),
            SchedulerConfig::Slurm {
                partition,
                ssh_config,
            } => Arc::new(SlurmScheduler::new(
                Arc::new(SshPool::new(ssh_config.clone())),
                partition.clone(),
            )),
            SchedulerConfig::Arq {
                redis_dsn,
                queue,
                max_jobs,
                job_timeout,
            } => Arc::new(
                QueueScheduler::new(redis_dsn, queue.clone(), *max_jobs, *job_timeout)
                    .map_err(|e| Error::DestinationInvalid(name.clone(), e.to_string()))?,
            ),
            SchedulerConfig::Dirac {
                storage_element,
                proxy,
            } => Arc::new(GridScheduler::new(storage_element.clone(), proxy.clone())),
        };

        let filesystem: Arc<dyn Filesystem> = match &destination.filesystem {
            FilesystemConfig::Local => Arc::new(LocalFs::new()),
            FilesystemConfig::Sftp { ssh_config, entry } => Arc::new(SftpFs::new(
                Arc::new(SshPool::new(ssh_config.clone())),
                entry.clone(),
            )),
            FilesystemConfig::Dirac {
                lfn_root,
                storage_element,
                proxy,
            } => Arc::new(GridFs::new(
                lfn_root.clone(),
                storage_element.clone(),
                proxy.clone(),
            )),
        };

        debug!("Constructed destination '{name}'.");
        destinations.insert(
            name.clone(),
            Destination {
                name: name.clone(),
                scheduler,
                filesystem,
            },
        );
    }

    Ok(destinations)
}

/// Selects the destination for one job.
///
/// Pickers must be pure with respect to their arguments and are called
/// exactly once per job. `destinations` lists the configured destination
/// names in declaration order.
pub trait DestinationPicker: Send + Sync {
    fn pick(
        &self,
        job_dir: &Path,
        application: &str,
        principal: &Principal,
        destinations: &[String],
    ) -> String;
}

/// Always selects the first configured destination.
pub struct FirstPicker;

impl DestinationPicker for FirstPicker {
    fn pick(
        &self,
        _job_dir: &Path,
        _application: &str,
        _principal: &Principal,
        destinations: &[String],
    ) -> String {
        destinations.first().cloned().unwrap_or_default()
    }
}

/// Round-robins across the destinations in declaration order.
pub struct RotatePicker {
    next: AtomicUsize,
}

impl RotatePicker {
    pub fn new() -> Self {
        RotatePicker {
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for RotatePicker {
    fn default() -> Self {
        RotatePicker::new()
    }
}

impl DestinationPicker for RotatePicker {
    fn pick(
        &self,
        _job_dir: &Path,
        _application: &str,
        _principal: &Principal,
        destinations: &[String],
    ) -> String {
        if destinations.is_empty() {
            return String::new();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        destinations[index % destinations.len()].clone()
    }
}

/// Named picker implementations, populated at startup.
///
/// Site-specific pickers are compiled in and registered here before the
/// orchestrator is constructed; the configuration refers to them by name.
pub struct PickerRegistry {
    pickers: HashMap<String, Arc<dyn DestinationPicker>>,
}

impl PickerRegistry {
    /// The built-in pickers: `first` and `rotate`.
    pub fn built_in() -> Self {
        let mut pickers: HashMap<String, Arc<dyn DestinationPicker>> = HashMap::new();
        pickers.insert("first".to_string(), Arc::new(FirstPicker));
        pickers.insert("rotate".to_string(), Arc::new(RotatePicker::new()));
        PickerRegistry { pickers }
    }

    /// Register an additional named picker.
    pub fn register(&mut self, name: &str, picker: Arc<dyn DestinationPicker>) {
        self.pickers.insert(name.to_string(), picker);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DestinationPicker>, Error> {
        self.pickers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPickerName(name.to_string()))
    }
}

impl Default for PickerRegistry {
    fn default() -> Self {
        PickerRegistry::built_in()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    fn principal() -> Principal {
        Principal {
            user_id: "user1".to_string(),
            roles: Vec::new(),
            issuer: "test".to_string(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    #[parallel]
    fn first_picker_is_stable() {
        let picker = FirstPicker;
        let destinations = names(&["d1", "d2", "d3"]);
        for _ in 0..3 {
            let choice = picker.pick(Path::new("/jobs/1"), "wc", &principal(), &destinations);
            assert_eq!(choice, "d1");
        }
    }

    #[test]
    #[parallel]
    fn rotate_picker_round_robins() {
        let picker = RotatePicker::new();
        let destinations = names(&["d1", "d2", "d3"]);

        let picks: Vec<String> = (0..7)
            .map(|i| {
                picker.pick(
                    Path::new(&format!("/jobs/{i}")),
                    "wc",
                    &principal(),
                    &destinations,
                )
            })
            .collect();
        assert_eq!(picks, ["d1", "d2", "d3", "d1", "d2", "d3", "d1"]);
    }

    #[test]
    #[parallel]
    fn registry_resolves_built_ins_and_custom_pickers() {
        let mut registry = PickerRegistry::built_in();
        registry.get("first").expect("built in");
        registry.get("rotate").expect("built in");

        assert!(matches!(
            registry.get("by_hand"),
            Err(Error::UnknownPickerName(name)) if name == "by_hand"
        ));

        struct LastPicker;
        impl DestinationPicker for LastPicker {
            fn pick(
                &self,
                _job_dir: &Path,
                _application: &str,
                _principal: &Principal,
                destinations: &[String],
            ) -> String {
                destinations.last().cloned().unwrap_or_default()
            }
        }

        registry.register("last", Arc::new(LastPicker));
        let picker = registry.get("last").unwrap();
        assert_eq!(
            picker.pick(
                Path::new("/jobs/1"),
                "wc",
                &principal(),
                &names(&["d1", "d2"])
            ),
            "d2"
        );
    }

    #[tokio::test]
    #[parallel]
    async fn destinations_are_built_in_declaration_order() {
        let configuration = Configuration::parse_str(
            Path::new("config.yaml"),
            r"
job_root_dir: /tmp/jobs
destinations:
  fast:
    scheduler:
      type: memory
      slots: 2
    filesystem:
      type: local
  slow:
    scheduler:
      type: memory
    filesystem:
      type: local
",
        )
        .expect("valid YAML");

        let destinations = build_destinations(&configuration).expect("constructible");
        let names: Vec<&String> = destinations.keys().collect();
        assert_eq!(names, ["fast", "slow"]);

        for destination in destinations.values() {
            destination.scheduler.close().await;
        }
    }
}
