use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::trace;

use crate::{CopyCallback, CopyOutcome, Copier, DataDevice, Region};

enum Job {
    Copy { from: Region, to: Region, callback: CopyCallback },
    Zero { to: Region, callback: CopyCallback },
    Shutdown,
}

/// A fixed-size pool of worker threads performing copy/zero against a
/// [`DataDevice`], invoking callbacks from whichever worker thread picked up
/// the job — matching the "callback delivered on the copier's thread"
/// contract.
pub struct ThreadCopier {
    jobs: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadCopier {
    pub fn new(device: DataDevice, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = bounded::<Job>(1024);
        let workers = (0..worker_count)
            .map(|id| {
                let rx = rx.clone();
                let device = device.clone();
                std::thread::Builder::new()
                    .name(format!("thin-copier-{id}"))
                    .spawn(move || {
                        for job in rx {
                            match job {
                                Job::Copy { from, to, callback } => {
                                    trace!(from = from.block, to = to.block, "copier: copy");
                                    device.copy_block(from.block, to.block);
                                    callback(CopyOutcome::ok());
                                }
                                Job::Zero { to, callback } => {
                                    trace!(to = to.block, "copier: zero");
                                    device.zero_block(to.block);
                                    callback(CopyOutcome::ok());
                                }
                                Job::Shutdown => break,
                            }
                        }
                    })
                    .expect("failed to spawn copier worker thread")
            })
            .collect();
        ThreadCopier { jobs: tx, workers }
    }
}

impl Copier for ThreadCopier {
    fn copy(&self, from: Region, to: Region, callback: CopyCallback) {
        let _ = self.jobs.send(Job::Copy { from, to, callback });
    }

    fn zero(&self, to: Region, callback: CopyCallback) {
        let _ = self.jobs.send(Job::Zero { to, callback });
    }
}

impl Drop for ThreadCopier {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.jobs.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn zero_then_copy_round_trips_through_the_device() {
        let device = DataDevice::new(512);
        let copier = ThreadCopier::new(device.clone(), 2);

        let (tx, rx) = mpsc::channel();
        copier.zero(Region { block: 0 }, Box::new(move |outcome| tx.send(outcome).unwrap()));
        let outcome = rx.recv().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(device.read_block(0), vec![0u8; 512]);

        device.write_block(0, vec![7u8; 512]);
        let (tx, rx) = mpsc::channel();
        copier.copy(Region { block: 0 }, Region { block: 1 }, Box::new(move |o| tx.send(o).unwrap()));
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(device.read_block(1), vec![7u8; 512]);
    }
}
