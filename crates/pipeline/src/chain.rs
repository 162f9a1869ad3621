//! Stage chain construction and workers

use alert_model::AlertEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::{Shutdown, ShutdownListener};
use crate::stage::{Forwarder, Stage};

/// Default capacity of each inter-stage queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Collects stages before wiring them
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    capacity: usize,
    sink: Option<mpsc::Sender<AlertEvent>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            sink: None,
        }
    }

    /// Register a stage; order of registration does not matter
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Queue capacity between stages
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Hand events leaving the last stage to `tx` instead of discarding them
    pub fn sink(mut self, tx: mpsc::Sender<AlertEvent>) -> Self {
        self.sink = Some(tx);
        self
    }

    /// Sort stages by ascending priority, wire each stage's output to the
    /// next stage's input, terminate in the sink and spawn one task per stage.
    pub fn start(mut self, input: mpsc::Receiver<AlertEvent>, shutdown: &Shutdown) -> Pipeline {
        self.stages.sort_by_key(|s| s.priority());

        let mut workers = Vec::with_capacity(self.stages.len() + 1);
        let mut order = Vec::with_capacity(self.stages.len());
        let mut upstream = input;

        for stage in self.stages {
            let (out, downstream) = Forwarder::channel(self.capacity);
            order.push(stage.name().to_string());
            workers.push(tokio::spawn(run_stage(
                stage,
                upstream,
                out,
                shutdown.subscribe(),
            )));
            upstream = downstream;
        }

        workers.push(tokio::spawn(run_sink(upstream, self.sink, shutdown.subscribe())));
        info!("Pipeline started with stages: {:?}", order);

        Pipeline { workers, order }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running stage chain
pub struct Pipeline {
    workers: Vec<JoinHandle<()>>,
    order: Vec<String>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Stage names in processing order
    pub fn stage_names(&self) -> &[String] {
        &self.order
    }

    /// Wait for every worker, including the sink, to finish
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Pipeline worker ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}

async fn run_stage(
    stage: Arc<dyn Stage>,
    mut input: mpsc::Receiver<AlertEvent>,
    out: Forwarder,
    mut shutdown: ShutdownListener,
) {
    debug!("Starting stage {} (priority {})", stage.name(), stage.priority());

    loop {
        tokio::select! {
            event = input.recv() => match event {
                Some(event) => {
                    if let Err(e) = stage.process(event, &out).await {
                        warn!("Stage {} dropped an event: {}", stage.name(), e);
                    }
                }
                None => {
                    debug!("Stage {} input closed", stage.name());
                    stage.finish(&out).await;
                    break;
                }
            },
            _ = shutdown.recv() => {
                debug!("Stage {} observed shutdown", stage.name());
                break;
            }
        }
    }

    debug!("Stage {} stopped", stage.name());
}

async fn run_sink(
    mut input: mpsc::Receiver<AlertEvent>,
    sink: Option<mpsc::Sender<AlertEvent>>,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            event = input.recv() => match event {
                Some(event) => match &sink {
                    Some(tx) => {
                        let _ = tx.send(event).await;
                    }
                    None => debug!(
                        "Sink discarding {} event for alert {}",
                        event.event_type, event.alert.id
                    ),
                },
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
