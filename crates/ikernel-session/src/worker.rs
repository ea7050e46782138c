//! The task worker.
//!
//! Execute requests are queued by the session and drained here on a
//! dedicated thread, keeping the socket loop responsive while user
//! code runs. The worker owns the evaluator, the execution counter and
//! the busy/idle status: exactly one busy and one idle status is
//! published per run of consecutive tasks.

use std::{
    collections::VecDeque,
    io::{self, Write},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use ikernel_engine::{
    EvalError, Evaluator,
    eval_io::{self, EvalStreams},
};
use ikernel_protocol::{Channel, Message};

use crate::display::DisplayFormatter;

/// Queue poll interval when no task is pending.
const SLEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Buffered stream output is flushed once it reaches this many bytes.
const STREAM_BUFFER_SIZE: usize = 240;

/// One queued execute request.
pub struct SessionTask {
    /// The originating request; replies and output parent to it.
    pub request: Message,
    pub code: String,
    /// Suppress stream and display output.
    pub silent: bool,
    /// Whether a successful run advances the execution counter.
    pub record: bool,
}

/// Shared queue of outgoing messages, drained by the session loop.
#[derive(Clone, Default)]
pub struct PublishQueue(Arc<Mutex<VecDeque<Message>>>);

impl PublishQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.0.lock().unwrap().push_back(message);
    }

    /// Take every queued message, preserving order.
    #[must_use]
    pub fn drain(&self) -> Vec<Message> {
        self.0.lock().unwrap().drain(..).collect()
    }
}

/// Shared queue of pending tasks, fed by the session loop.
#[derive(Clone, Default)]
pub struct TaskQueue(Arc<Mutex<VecDeque<SessionTask>>>);

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: SessionTask) {
        self.0.lock().unwrap().push_back(task);
    }

    #[must_use]
    pub fn pop(&self) -> Option<SessionTask> {
        self.0.lock().unwrap().pop_front()
    }
}

/// Stream sink that publishes buffered output as stream messages.
struct PublishingWriter {
    publish: PublishQueue,
    parent: Message,
    name: &'static str,
    buffer: Vec<u8>,
    /// Flush whenever the buffer reaches the size threshold; otherwise
    /// output only leaves on an explicit flush or on drop.
    auto_flush: bool,
}

impl PublishingWriter {
    fn new(publish: PublishQueue, parent: Message, name: &'static str, auto_flush: bool) -> Self {
        Self {
            publish,
            parent,
            name,
            buffer: Vec::new(),
            auto_flush,
        }
    }

    /// Publish buffered bytes as one stream message. When
    /// `keep_partial` is set, a multi-byte character still missing its
    /// continuation bytes stays buffered for the next emit, so chunk
    /// boundaries never split a character.
    fn emit(&mut self, keep_partial: bool) {
        if self.buffer.is_empty() {
            return;
        }
        let split = if keep_partial {
            match std::str::from_utf8(&self.buffer) {
                Ok(_) => self.buffer.len(),
                // An incomplete trailing character; hold it back.
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => self.buffer.len(),
            }
        } else {
            self.buffer.len()
        };
        if split == 0 {
            return;
        }
        let text = String::from_utf8_lossy(&self.buffer[..split]).into_owned();
        self.buffer.drain(..split);
        self.publish
            .push(Message::stream(&self.parent, self.name, &text));
    }
}

impl Write for PublishingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            self.buffer.push(*byte);
            if self.auto_flush && self.buffer.len() >= STREAM_BUFFER_SIZE {
                self.emit(true);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit(false);
        Ok(())
    }
}

impl Drop for PublishingWriter {
    fn drop(&mut self) {
        self.emit(false);
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "evaluation panicked"
    }
}

/// Processes tasks one at a time against the owned evaluator.
struct TaskProcessor {
    evaluator: Box<dyn Evaluator>,
    formatter: Box<dyn DisplayFormatter>,
    publish: PublishQueue,
    execution_count: u64,
}

impl TaskProcessor {
    fn new(
        evaluator: Box<dyn Evaluator>,
        formatter: Box<dyn DisplayFormatter>,
        publish: PublishQueue,
    ) -> Self {
        Self {
            evaluator,
            formatter,
            publish,
            execution_count: 1,
        }
    }

    fn streams(&self, task: &SessionTask) -> EvalStreams {
        if task.silent {
            EvalStreams {
                stdout: Box::new(io::sink()),
                stderr: Box::new(io::sink()),
            }
        } else {
            EvalStreams {
                stdout: Box::new(PublishingWriter::new(
                    self.publish.clone(),
                    task.request.clone(),
                    "stdout",
                    true,
                )),
                stderr: Box::new(PublishingWriter::new(
                    self.publish.clone(),
                    task.request.clone(),
                    "stderr",
                    false,
                )),
            }
        }
    }

    fn process(&mut self, task: &SessionTask) {
        let channel = task.request.channel().unwrap_or(Channel::Shell);

        // A blank submission is acknowledged without evaluation.
        if task.code.trim().is_empty() {
            self.publish.push(
                Message::execute_success(&task.request, self.execution_count)
                    .associate_channel(channel),
            );
            return;
        }

        let evaluation_id = if task.record { self.execution_count } else { 0 };
        let guard = eval_io::redirect(self.streams(task));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.evaluator
                .evaluate(&task.code, evaluation_id, &task.request.metadata)
        }));
        eval_io::flush();
        drop(guard);

        match outcome {
            Ok(Ok(result)) => {
                if let Some(value) = result {
                    if !task.silent {
                        let data = self.formatter.format(&value);
                        self.publish.push(Message::display_data(&task.request, &data));
                    }
                }
                self.publish.push(
                    Message::execute_success(&task.request, self.execution_count)
                        .associate_channel(channel),
                );
                if task.record {
                    self.execution_count += 1;
                }
            }
            Ok(Err(EvalError::StaleState { variables })) => {
                // Nothing ran and the diagnostic already went out on the
                // evaluation stderr; acknowledge without advancing.
                tracing::warn!(?variables, "submission aborted on stale tracked state");
                self.publish.push(
                    Message::execute_success(&task.request, self.execution_count)
                        .associate_channel(channel),
                );
            }
            Ok(Err(error)) => {
                self.publish.push(
                    Message::execute_error(&task.request, self.execution_count, &error.to_string())
                        .associate_channel(channel),
                );
            }
            Err(payload) => {
                let text = panic_text(payload.as_ref());
                tracing::error!("evaluation panicked: {text}");
                self.publish.push(
                    Message::execute_error(&task.request, self.execution_count, text)
                        .associate_channel(channel),
                );
            }
        }
    }
}

fn run(mut processor: TaskProcessor, tasks: TaskQueue, stopped: Arc<AtomicBool>) {
    let mut busy = false;
    while !stopped.load(Ordering::SeqCst) {
        match tasks.pop() {
            Some(task) => {
                if !busy {
                    processor.publish.push(Message::kernel_status(true));
                    busy = true;
                }
                processor.process(&task);
            }
            None => {
                if busy {
                    processor.publish.push(Message::kernel_status(false));
                    busy = false;
                }
                thread::sleep(SLEEP_INTERVAL);
            }
        }
    }
}

/// Owns the worker thread draining the task queue.
pub struct SessionWorker {
    stopped: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SessionWorker {
    /// Spawn the worker thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        evaluator: Box<dyn Evaluator>,
        formatter: Box<dyn DisplayFormatter>,
        publish: PublishQueue,
        tasks: TaskQueue,
    ) -> io::Result<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let processor = TaskProcessor::new(evaluator, formatter, publish);
        let handle = thread::Builder::new().name("session-worker".into()).spawn({
            let stopped = Arc::clone(&stopped);
            move || run(processor, tasks, stopped)
        })?;
        Ok(Self {
            stopped,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for the thread to exit.
    pub fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;
    use ikernel_protocol::Payload;
    use serde_json::{Value, json};

    use super::*;
    use crate::display::MimeFormatter;

    struct StubEvaluator {
        responses: VecDeque<Result<Option<Value>, EvalError>>,
        calls: Arc<Mutex<Vec<(String, u64)>>>,
        stdout: Option<String>,
    }

    impl Evaluator for StubEvaluator {
        fn evaluate(
            &mut self,
            text: &str,
            evaluation_id: u64,
            _metadata: &ikernel_engine::Metadata,
        ) -> Result<Option<Value>, EvalError> {
            self.calls
                .lock()
                .unwrap()
                .push((text.to_owned(), evaluation_id));
            if let Some(output) = &self.stdout {
                eval_io::write_stdout(output).unwrap();
            }
            self.responses.pop_front().unwrap_or(Ok(None))
        }
    }

    struct PanickingEvaluator;

    impl Evaluator for PanickingEvaluator {
        fn evaluate(
            &mut self,
            _text: &str,
            _evaluation_id: u64,
            _metadata: &ikernel_engine::Metadata,
        ) -> Result<Option<Value>, EvalError> {
            panic!("boom");
        }
    }

    fn task(code: &str, silent: bool, record: bool) -> SessionTask {
        let mut header = Payload::new();
        header.insert("msg_id".into(), json!("req"));
        header.insert("msg_type".into(), json!("execute_request"));
        let request = Message::from_parts(
            Some(Bytes::from_static(b"client")),
            header,
            Payload::new(),
            Payload::new(),
            Payload::new(),
        )
        .associate_channel(Channel::Shell);
        SessionTask {
            request,
            code: code.into(),
            silent,
            record,
        }
    }

    fn processor(
        responses: Vec<Result<Option<Value>, EvalError>>,
        stdout: Option<&str>,
    ) -> (TaskProcessor, PublishQueue, Arc<Mutex<Vec<(String, u64)>>>) {
        let publish = PublishQueue::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let evaluator = StubEvaluator {
            responses: responses.into_iter().collect(),
            calls: Arc::clone(&calls),
            stdout: stdout.map(str::to_owned),
        };
        let processor =
            TaskProcessor::new(Box::new(evaluator), Box::new(MimeFormatter), publish.clone());
        (processor, publish, calls)
    }

    fn reply_counts(messages: &[Message]) -> Vec<u64> {
        messages
            .iter()
            .filter(|m| m.msg_type() == "execute_reply")
            .map(|m| m.content["execution_count"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_counter_advances_only_for_recorded_success() {
        let (mut processor, publish, _) = processor(
            vec![
                Ok(Some(json!(5))),
                Ok(None),
                Err(EvalError::Execution("division by zero".into())),
                Ok(None),
            ],
            None,
        );

        processor.process(&task("x = 5", false, true));
        processor.process(&task("x", false, false));
        processor.process(&task("boom", false, true));
        processor.process(&task("y = 1", false, true));

        assert_eq!(reply_counts(&publish.drain()), vec![1, 2, 2, 2]);
        assert_eq!(processor.execution_count, 3);
    }

    #[test]
    fn test_blank_submission_acknowledged_without_evaluation() {
        let (mut processor, publish, calls) = processor(vec![], None);

        processor.process(&task("   \n", false, true));

        assert!(calls.lock().unwrap().is_empty());
        let messages = publish.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type(), "execute_reply");
        assert_eq!(messages[0].content["status"], json!("ok"));
        assert_eq!(processor.execution_count, 1);
    }

    #[test]
    fn test_silent_task_publishes_no_output() {
        let (mut processor, publish, _) = processor(vec![Ok(Some(json!(7)))], Some("ignored"));

        processor.process(&task("7", true, false));

        let messages = publish.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].msg_type(), "execute_reply");
    }

    #[test]
    fn test_stdout_flushes_in_buffer_sized_chunks() {
        let text = "a".repeat(600);
        let (mut processor, publish, _) = processor(vec![Ok(None)], Some(&text));

        processor.process(&task("print", false, true));

        let lengths: Vec<usize> = publish
            .drain()
            .iter()
            .filter(|m| m.msg_type() == "stream")
            .map(|m| m.content["text"].as_str().unwrap().len())
            .collect();
        assert_eq!(lengths, vec![240, 240, 120]);
    }

    #[test]
    fn test_multibyte_output_survives_chunk_boundary() {
        // The two-byte character lands exactly on the flush threshold.
        let text = format!("{}étail", "a".repeat(STREAM_BUFFER_SIZE - 1));
        let (mut processor, publish, _) = processor(vec![Ok(None)], Some(&text));

        processor.process(&task("print", false, true));

        let chunks: Vec<String> = publish
            .drain()
            .iter()
            .filter(|m| m.msg_type() == "stream")
            .map(|m| m.content["text"].as_str().unwrap().to_owned())
            .collect();
        assert!(
            chunks.iter().all(|chunk| !chunk.contains('\u{FFFD}')),
            "no chunk may carry a mangled character: {chunks:?}"
        );
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_evaluation_error_reply() {
        let (mut processor, publish, _) = processor(
            vec![Err(EvalError::Execution("something broke".into()))],
            None,
        );

        processor.process(&task("bad", false, true));

        let messages = publish.drain();
        let reply = messages.last().unwrap();
        assert_eq!(reply.msg_type(), "execute_reply");
        assert_eq!(reply.content["status"], json!("error"));
        assert_eq!(reply.content["evalue"], json!("something broke"));
        assert_eq!(processor.execution_count, 1);
    }

    #[test]
    fn test_display_data_precedes_reply() {
        let (mut processor, publish, _) = processor(vec![Ok(Some(json!("6")))], None);

        processor.process(&task("x + 1", false, true));

        let messages = publish.drain();
        let kinds: Vec<&str> = messages.iter().map(Message::msg_type).collect();
        assert_eq!(kinds, vec!["display_data", "execute_reply"]);
        assert_eq!(messages[0].content["data"]["text/plain"], json!("6"));
    }

    #[test]
    fn test_stale_abort_acknowledges_without_advancing() {
        let (mut processor, publish, _) = processor(
            vec![
                Err(EvalError::StaleState {
                    variables: vec!["x".into()],
                }),
                Ok(None),
            ],
            None,
        );

        processor.process(&task("x + y", false, true));
        processor.process(&task("y", false, true));

        let counts = reply_counts(&publish.drain());
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(processor.execution_count, 2);
    }

    #[test]
    fn test_panicking_evaluation_reports_an_error() {
        let publish = PublishQueue::new();
        let mut processor = TaskProcessor::new(
            Box::new(PanickingEvaluator),
            Box::new(MimeFormatter),
            publish.clone(),
        );

        processor.process(&task("explode", false, true));

        let messages = publish.drain();
        let reply = messages.last().unwrap();
        assert_eq!(reply.content["status"], json!("error"));
        assert_eq!(reply.content["evalue"], json!("boom"));
        assert_eq!(processor.execution_count, 1);
    }

    #[test]
    fn test_one_busy_idle_pair_per_run_of_tasks() {
        let publish = PublishQueue::new();
        let tasks = TaskQueue::new();
        tasks.push(task("a", false, true));
        tasks.push(task("b", false, true));

        let evaluator = StubEvaluator {
            responses: vec![Ok(None), Ok(None)].into_iter().collect(),
            calls: Arc::new(Mutex::new(Vec::new())),
            stdout: None,
        };
        let mut worker = SessionWorker::spawn(
            Box::new(evaluator),
            Box::new(MimeFormatter),
            publish.clone(),
            tasks,
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut statuses = Vec::new();
        let mut replies = 0;
        while Instant::now() < deadline {
            for message in publish.drain() {
                match message.msg_type() {
                    "status" => statuses
                        .push(message.content["execution_state"].as_str().unwrap().to_owned()),
                    "execute_reply" => replies += 1,
                    _ => {}
                }
            }
            if statuses.iter().any(|s| s == "idle") {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        worker.stop();

        assert_eq!(replies, 2);
        assert_eq!(statuses, vec!["busy", "idle"]);
    }
}
