//! Channel-based processor chain
//!
//! Each processor runs in its own task, connected by bounded channels, so a
//! slow stage backpressures its producer instead of the whole session.

use std::sync::Arc;
use tokio::sync::mpsc;

use callweave_core::{Frame, FrameProcessor, ProcessorContext};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// An ordered chain of frame processors
pub struct ProcessorChain {
    name: String,
    processors: Vec<Arc<dyn FrameProcessor>>,
    channel_capacity: usize,
}

impl ProcessorChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processors: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn add<P: FrameProcessor + 'static>(&mut self, processor: P) -> &mut Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn add_shared(&mut self, processor: Arc<dyn FrameProcessor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run one frame through every stage without spawning tasks
    pub async fn process_one(
        &self,
        frame: Frame,
        context: &mut ProcessorContext,
    ) -> callweave_core::Result<Vec<Frame>> {
        let mut frames = vec![frame];

        for processor in &self.processors {
            let mut next = Vec::new();
            for f in frames {
                next.extend(processor.process(f, context).await?);
            }
            frames = next;
        }

        Ok(frames)
    }

    /// Start the streaming pipeline; returns the input sender and the final
    /// stage's output receiver.
    pub fn run(&self, context: ProcessorContext) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
        let (input_tx, input_rx) = mpsc::channel::<Frame>(self.channel_capacity);
        let mut current_rx = input_rx;

        for processor in &self.processors {
            let processor = Arc::clone(processor);
            let mut context = context.clone();
            let (next_tx, next_rx) = mpsc::channel::<Frame>(self.channel_capacity);
            let mut rx = current_rx;
            let name = processor.name();

            tokio::spawn(async move {
                if let Err(e) = processor.on_start(&mut context).await {
                    tracing::error!(processor = name, error = %e, "Processor on_start failed");
                }

                while let Some(frame) = rx.recv().await {
                    let is_eos = frame.is_end_of_stream();

                    match processor.process(frame, &mut context).await {
                        Ok(frames) => {
                            for frame in frames {
                                if next_tx.send(frame).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(processor = name, error = %e, "Processor error");
                            let _ = next_tx
                                .send(Frame::Error {
                                    stage: name.to_string(),
                                    message: e.to_string(),
                                    recoverable: !e.kind().is_session_fatal(),
                                })
                                .await;
                        }
                    }

                    if is_eos {
                        if let Err(e) = processor.on_stop(&mut context).await {
                            tracing::error!(processor = name, error = %e, "Processor on_stop failed");
                        }
                        return;
                    }
                }
            });

            current_rx = next_rx;
        }

        (input_tx, current_rx)
    }
}
