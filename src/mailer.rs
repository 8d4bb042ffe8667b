use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

/// A message handed to the delivery collaborator. The core's contract ends
/// at "enqueued": nothing downstream reports delivery back.
#[derive(Debug, Clone)]
pub struct EmailJob {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub struct Mailer {
    tx: Option<Sender<EmailJob>>,
    worker: Option<JoinHandle<()>>,
}

impl Mailer {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<EmailJob>();
        let worker = std::thread::spawn(move || {
            for job in rx {
                // Delivery itself is out of scope. The queue drains here and
                // the attempt is only observable in the logs.
                tracing::info!(to = %job.to, subject = %job.subject, "mail dispatched");
            }
        });
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, job: EmailJob) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                tracing::warn!("mail queue worker is gone; message dropped");
            }
        }
    }
}

impl Drop for Mailer {
    fn drop(&mut self) {
        // Close the channel so the worker drains and exits.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
