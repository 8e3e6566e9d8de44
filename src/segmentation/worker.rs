// ============================================================================
// ASYNC INFERENCE: the model lives on its own thread
// ============================================================================
//
// The UI thread never blocks on the encoder or decoder. It sends `Command`s
// and polls `Event`s once per frame; every event carries the image
// generation (and, for predictions, the request id) it was computed for, so
// the receiver can drop anything that no longer matches what is on screen.

use super::{PixelBox, Prediction, SegmentationAdapter, SegmentationModel};
use crate::error::SegmentError;
use image::RgbImage;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::Duration;

pub enum Command {
    SetImage { generation: u64, image: Arc<RgbImage> },
    Predict { generation: u64, request_id: u64, pixel_box: PixelBox },
    Shutdown,
}

#[derive(Debug)]
pub enum Event {
    ModelReady { device: String },
    ModelFailed(SegmentError),
    ImageReady { generation: u64 },
    ImageFailed { generation: u64, error: SegmentError },
    PredictionDone { generation: u64, request_id: u64, result: Result<Prediction, SegmentError> },
}

/// Handle to the inference thread. Dropping it asks the thread to stop once
/// its current job finishes; the UI never waits for that.
pub struct InferenceWorker {
    commands: Sender<Command>,
    events: Receiver<Event>,
}

impl InferenceWorker {
    /// Start the thread. `load` runs on the new thread so slow model loads
    /// never stall the window; its outcome arrives as `ModelReady` or
    /// `ModelFailed`.
    pub fn spawn<M, F>(load: F) -> Self
    where
        M: SegmentationModel + 'static,
        F: FnOnce() -> Result<M, SegmentError> + Send + 'static,
    {
        let (commands, command_rx) = mpsc::channel();
        let (event_tx, events) = mpsc::channel();
        let failure_tx = event_tx.clone();

        let spawned = std::thread::Builder::new()
            .name("segmentfe-inference".to_string())
            .spawn(move || run(load, command_rx, event_tx));
        if let Err(e) = spawned {
            crate::log_err!("Could not start inference thread: {}", e);
            let _ = failure_tx.send(Event::ModelFailed(SegmentError::ModelUnavailable(format!(
                "could not start inference thread: {}",
                e
            ))));
        }
        Self { commands, events }
    }

    pub fn set_image(&self, generation: u64, image: Arc<RgbImage>) {
        let _ = self.commands.send(Command::SetImage { generation, image });
    }

    pub fn predict(&self, generation: u64, request_id: u64, pixel_box: PixelBox) {
        let _ = self.commands.send(Command::Predict { generation, request_id, pixel_box });
    }

    /// Next finished event, if any. Never blocks.
    pub fn poll(&self) -> Option<Event> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking variant of `poll`, for callers without a frame loop.
    pub fn wait(&self, timeout: Duration) -> Option<Event> {
        self.events.recv_timeout(timeout).ok()
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn run<M, F>(load: F, commands: Receiver<Command>, events: Sender<Event>)
where
    M: SegmentationModel,
    F: FnOnce() -> Result<M, SegmentError>,
{
    crate::log_info!("Inference thread started, loading model");
    let model = match catch_unwind(AssertUnwindSafe(load)) {
        Ok(Ok(model)) => model,
        Ok(Err(e)) => {
            crate::log_err!("{}", e);
            let _ = events.send(Event::ModelFailed(e));
            return;
        }
        Err(_) => {
            let _ = events.send(Event::ModelFailed(SegmentError::ModelUnavailable(
                "model loader panicked".into(),
            )));
            return;
        }
    };
    let mut adapter = SegmentationAdapter::new(model);
    let _ = events.send(Event::ModelReady { device: adapter.device() });

    let mut queue: VecDeque<Command> = VecDeque::new();
    loop {
        if queue.is_empty() {
            match commands.recv() {
                Ok(cmd) => queue.push_back(cmd),
                Err(_) => break,
            }
        }
        // Pull in everything already waiting so superseded jobs can be skipped.
        while let Ok(cmd) = commands.try_recv() {
            queue.push_back(cmd);
        }
        let Some(cmd) = queue.pop_front() else { continue };

        match cmd {
            Command::Shutdown => break,
            Command::SetImage { generation, image } => {
                if queue.iter().any(|c| matches!(c, Command::SetImage { .. })) {
                    crate::log_info!("Skipping embedding for superseded image #{}", generation);
                    continue;
                }
                let outcome = guarded(|| adapter.set_image(generation, &image));
                let event = match outcome {
                    Ok(()) => Event::ImageReady { generation },
                    Err(error) => Event::ImageFailed { generation, error },
                };
                let _ = events.send(event);
            }
            Command::Predict { generation, request_id, pixel_box } => {
                let superseded = queue
                    .iter()
                    .any(|c| matches!(c, Command::Predict { .. } | Command::SetImage { .. }));
                if superseded {
                    crate::log_info!("Skipping superseded analysis request #{}", request_id);
                    continue;
                }
                let result = guarded(|| adapter.predict(generation, pixel_box));
                let _ = events.send(Event::PredictionDone { generation, request_id, result });
            }
        }
    }
    crate::log_info!("Inference thread stopped");
}

/// Run one model call, turning a panic inside the model into an error for
/// this operation only.
fn guarded<T>(f: impl FnOnce() -> Result<T, SegmentError>) -> Result<T, SegmentError> {
    catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(SegmentError::Inference("model panicked during inference".into())))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Calls, FakeModel};
    use super::*;
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn reports_ready_then_answers_predictions() {
        let (model, calls) = FakeModel::new(vec![0.62, 0.91]);
        let worker = InferenceWorker::spawn(move || Ok(model));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ModelReady { .. })));

        worker.set_image(1, Arc::new(RgbImage::new(100, 100)));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ImageReady { generation: 1 })));

        worker.predict(1, 7, PixelBox::new(10, 10, 60, 80));
        match worker.wait(TIMEOUT) {
            Some(Event::PredictionDone { generation, request_id, result }) => {
                assert_eq!((generation, request_id), (1, 7));
                let prediction = result.unwrap();
                assert_eq!(prediction.best().score, 0.91);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(calls.lock().unwrap().predict, vec![PixelBox::new(10, 10, 60, 80)]);
    }

    #[test]
    fn load_failure_is_reported() {
        let worker = InferenceWorker::spawn(|| -> Result<FakeModel, SegmentError> {
            Err(SegmentError::ModelUnavailable("weights missing".into()))
        });
        assert!(matches!(
            worker.wait(TIMEOUT),
            Some(Event::ModelFailed(SegmentError::ModelUnavailable(_)))
        ));
    }

    #[test]
    fn invalid_box_comes_back_as_error() {
        let (model, calls) = FakeModel::new(vec![0.5]);
        let worker = InferenceWorker::spawn(move || Ok(model));
        worker.wait(TIMEOUT);
        worker.set_image(1, Arc::new(RgbImage::new(10, 10)));
        worker.wait(TIMEOUT);
        worker.predict(1, 1, PixelBox::new(5, 5, 5, 9));
        match worker.wait(TIMEOUT) {
            Some(Event::PredictionDone { result, .. }) => {
                assert!(matches!(result, Err(SegmentError::InvalidRegion(_))))
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(calls.lock().unwrap().predict.is_empty());
    }

    #[test]
    fn failed_embedding_is_reported_and_retry_succeeds() {
        let (mut model, calls) = FakeModel::new(vec![0.8]);
        model.fail_next_set_image = true;
        let worker = InferenceWorker::spawn(move || Ok(model));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ModelReady { .. })));

        let image = Arc::new(RgbImage::new(40, 40));
        worker.set_image(1, image.clone());
        match worker.wait(TIMEOUT) {
            Some(Event::ImageFailed { generation, error }) => {
                assert_eq!(generation, 1);
                assert!(error.is_recoverable());
            }
            other => panic!("expected ImageFailed, got {:?}", other),
        }

        // Analyze without features: an inference error, not "no image".
        worker.predict(1, 1, PixelBox::new(5, 5, 30, 30));
        match worker.wait(TIMEOUT) {
            Some(Event::PredictionDone { result, .. }) => {
                assert!(matches!(result, Err(SegmentError::Inference(_))), "{:?}", result)
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Analyze again, re-sending the image first.
        worker.set_image(1, image);
        worker.predict(1, 2, PixelBox::new(5, 5, 30, 30));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ImageReady { generation: 1 })));
        match worker.wait(TIMEOUT) {
            Some(Event::PredictionDone { request_id, result, .. }) => {
                assert_eq!(request_id, 2);
                assert_eq!(result.unwrap().best().score, 0.8);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(calls.lock().unwrap().set_image.len(), 2);
    }

    /// Worker whose model only finishes loading once the returned sender
    /// fires, so tests can queue commands behind the load.
    fn gated_worker(scores: Vec<f32>) -> (InferenceWorker, mpsc::Sender<()>, Arc<Mutex<Calls>>) {
        let (model, calls) = FakeModel::new(scores);
        let (go, gate) = mpsc::channel::<()>();
        let worker = InferenceWorker::spawn(move || {
            let _ = gate.recv();
            Ok(model)
        });
        (worker, go, calls)
    }

    #[test]
    fn later_prediction_supersedes_queued_one() {
        let (worker, go, calls) = gated_worker(vec![0.5]);
        worker.set_image(1, Arc::new(RgbImage::new(50, 50)));
        worker.predict(1, 1, PixelBox::new(0, 0, 10, 10));
        worker.predict(1, 2, PixelBox::new(5, 5, 20, 20));
        go.send(()).unwrap();

        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ModelReady { .. })));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ImageReady { generation: 1 })));
        match worker.wait(TIMEOUT) {
            Some(Event::PredictionDone { generation, request_id, result }) => {
                assert_eq!((generation, request_id), (1, 2));
                assert!(result.is_ok());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(worker.wait(Duration::from_millis(200)).is_none());
        assert_eq!(calls.lock().unwrap().predict, vec![PixelBox::new(5, 5, 20, 20)]);
    }

    #[test]
    fn new_image_supersedes_queued_work_for_old_one() {
        let (worker, go, calls) = gated_worker(vec![0.5]);
        worker.set_image(1, Arc::new(RgbImage::new(50, 50)));
        worker.predict(1, 1, PixelBox::new(0, 0, 10, 10));
        worker.set_image(2, Arc::new(RgbImage::new(30, 20)));
        go.send(()).unwrap();

        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ModelReady { .. })));
        assert!(matches!(worker.wait(TIMEOUT), Some(Event::ImageReady { generation: 2 })));
        assert!(worker.wait(Duration::from_millis(200)).is_none());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.set_image, vec![(30, 20)]);
        assert!(calls.predict.is_empty());
    }
}
