// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Settings;
use crate::errors;
use crate::node::TrackerNode;
use crate::packager::Packager;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

#[derive(Debug)]
pub enum PackagerCommand {
    Record(Box<TrackerNode>),
    Snapshot(oneshot::Sender<Packager>),
    Merge(Packager),
    Rollback(Packager),
    Shutdown,
}

#[derive(Clone)]
pub struct PackagerHandle {
    tx: mpsc::UnboundedSender<PackagerCommand>,
}

impl PackagerHandle {
    pub fn record(&self, tracker: TrackerNode) -> Result<(), errors::Service> {
        self.send(PackagerCommand::Record(Box::new(tracker)))
    }

    pub async fn snapshot(&self) -> Result<Packager, errors::Service> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(PackagerCommand::Snapshot(response_tx))?;

        response_rx
            .await
            .map_err(|_| errors::Service::ResponseDropped)
    }

    pub fn merge(&self, zone: Packager) -> Result<(), errors::Service> {
        self.send(PackagerCommand::Merge(zone))
    }

    pub fn rollback(&self, snapshot: Packager) -> Result<(), errors::Service> {
        self.send(PackagerCommand::Rollback(snapshot))
    }

    pub fn shutdown(&self) -> Result<(), errors::Service> {
        self.send(PackagerCommand::Shutdown)
    }

    fn send(&self, command: PackagerCommand) -> Result<(), errors::Service> {
        self.tx.send(command).map_err(|_| errors::Service::Closed)
    }
}

/// Owns the live [`Packager`] and applies commands in arrival order.
pub struct PackagerService {
    packager: Packager,
    rx: mpsc::UnboundedReceiver<PackagerCommand>,
}

impl PackagerService {
    pub fn new(settings: Settings) -> Result<(Self, PackagerHandle), errors::Creation> {
        let (tx, rx) = mpsc::unbounded_channel();
        let packager = Packager::with_settings(settings)?;

        let service = Self { packager, rx };

        let handle = PackagerHandle { tx };

        Ok((service, handle))
    }

    pub async fn run(mut self) {
        debug!("Packager service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                PackagerCommand::Record(tracker) => {
                    self.packager.record(&tracker);
                }

                PackagerCommand::Snapshot(response_tx) => {
                    let snapshot = self.packager.packets_snapshot();
                    if response_tx.send(snapshot).is_err() {
                        error!("Failed to send snapshot response - receiver dropped");
                    }
                }

                PackagerCommand::Merge(zone) => {
                    self.packager.merge_metric_packets(zone);
                }

                PackagerCommand::Rollback(snapshot) => {
                    self.packager.rollback(snapshot);
                }

                PackagerCommand::Shutdown => {
                    debug!("Packager service shutting down");
                    break;
                }
            }
        }

        debug!("Packager service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TrackerType;
    use std::collections::HashMap;

    fn tracker(duration: f64) -> TrackerNode {
        TrackerNode {
            tracker_type: TrackerType::WebAction,
            path: "WebAction/svc/ping".to_string(),
            duration,
            exclusive: duration,
            http_status: 200,
            apdex_t: 100.0,
            is_root: true,
            ..TrackerNode::default()
        }
    }

    #[tokio::test]
    async fn test_packager_service_basic_flow() {
        let (service, handle) =
            PackagerService::new(Settings::default()).expect("Failed to create packager service");

        // Start the service in a background task
        let service_task = tokio::spawn(service.run());

        handle.record(tracker(50.0)).expect("Failed to record");
        handle.record(tracker(70.0)).expect("Failed to record");

        let snapshot = handle.snapshot().await.expect("Failed to snapshot");
        let actions = snapshot.action_metrics(&HashMap::<String, u64>::new());
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].packet.call_count, 2);

        // The live packager restarted empty.
        let empty = handle.snapshot().await.expect("Failed to snapshot");
        assert!(empty.action_metrics(&HashMap::<String, u64>::new()).is_empty());

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_packager_service_rollback_and_merge() {
        let (service, handle) =
            PackagerService::new(Settings::default()).expect("Failed to create packager service");
        let service_task = tokio::spawn(service.run());

        handle.record(tracker(10.0)).expect("Failed to record");
        let snapshot = handle.snapshot().await.expect("Failed to snapshot");

        let zone = snapshot.create_data_zone();
        zone.record(&tracker(30.0));

        handle.rollback(snapshot).expect("Failed to rollback");
        handle.merge(zone).expect("Failed to merge");

        let restored = handle.snapshot().await.expect("Failed to snapshot");
        let apdex = restored.apdex_data(&HashMap::<String, u64>::new());
        assert_eq!(apdex.len(), 1);
        assert_eq!(apdex[0].packet.satisfying, 2);

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_packager_service_closed() {
        let (service, handle) =
            PackagerService::new(Settings::default()).expect("Failed to create packager service");
        drop(service);

        assert_eq!(handle.record(tracker(1.0)), Err(errors::Service::Closed));
        assert!(matches!(
            handle.snapshot().await,
            Err(errors::Service::Closed)
        ));
    }

    #[test]
    fn test_invalid_settings() {
        let settings = Settings {
            quantile: vec![0.0],
            ..Settings::default()
        };
        assert!(matches!(
            PackagerService::new(settings),
            Err(errors::Creation::InvalidQuantile(_))
        ));
    }
}
