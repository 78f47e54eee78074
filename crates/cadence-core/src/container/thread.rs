//! Running a container on its own OS thread.
//!
//! The thread is named after the container and sized to its stack
//! requirement. When a handler asks for a bigger stack the thread hands
//! the container to a freshly spawned one and exits; the continuation
//! runs there before the loop resumes.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{CmdAck, Command, Container, Envelope};
use crate::error::{CntrError, CntrResult};
use crate::event_loop::LoopExit;
use crate::transport::QueueSender;

type Slot = Arc<Mutex<Option<Container>>>;

/// Handle to a container running on its own thread.
#[derive(Debug)]
pub struct ContainerThread {
    commands: QueueSender<Envelope>,
    done: Receiver<Container>,
    relaunches: Arc<AtomicUsize>,
    name: String,
}

impl ContainerThread {
    /// Moves `container` onto a new thread and starts its loop.
    pub fn spawn(container: Container) -> CntrResult<Self> {
        let commands = container.command_sender();
        let name = container.name().to_owned();
        let (exit, done) = crossbeam_channel::bounded(1);
        let relaunches = Arc::new(AtomicUsize::new(0));

        let slot: Slot = Arc::new(Mutex::new(Some(container)));
        launch(&slot, exit, Arc::clone(&relaunches))
            .map_err(|err| CntrError::failed(format!("spawning {name}: {err}")))?;
        tracing::info!(%name, "container thread started");

        Ok(Self {
            commands,
            done,
            relaunches,
            name,
        })
    }

    /// Command queue of the container.
    pub fn commands(&self) -> QueueSender<Envelope> {
        self.commands.clone()
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a command; the acknowledgment arrives on the returned receiver.
    pub fn send(&self, command: Command) -> CntrResult<Receiver<CmdAck>> {
        let (env, rx) = Envelope::with_reply(command);
        self.commands.push(env)?;
        Ok(rx)
    }

    /// Sends a command and waits for its acknowledgment.
    pub fn call(&self, command: Command, timeout: Duration) -> CntrResult<CmdAck> {
        let rx = self.send(command)?;
        rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CntrError::not_ready(format!("{} did not answer", self.name)),
            RecvTimeoutError::Disconnected => {
                CntrError::failed(format!("{} dropped the command", self.name))
            }
        })
    }

    /// Threads replaced so far because of stack growth.
    pub fn relaunch_count(&self) -> usize {
        self.relaunches.load(Ordering::Acquire)
    }

    /// Waits until the loop terminates and returns the container.
    pub fn join(self) -> CntrResult<Container> {
        self.done
            .recv()
            .map_err(|_| CntrError::failed(format!("{} exited without handing back", self.name)))
    }

    /// Like [`ContainerThread::join`], giving up after `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> CntrResult<Container> {
        self.done.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => CntrError::not_ready(format!("{} still running", self.name)),
            RecvTimeoutError::Disconnected => {
                CntrError::failed(format!("{} exited without handing back", self.name))
            }
        })
    }

    /// Destroys the container and waits for its thread to finish.
    pub fn destroy(self, timeout: Duration) -> CntrResult<Container> {
        let ack = self.call(Command::Destroy, timeout)?;
        ack.result?;
        self.join_timeout(timeout)
    }
}

impl Container {
    /// Stack the next thread needs, including a parked continuation.
    fn launch_stack_bytes(&self) -> usize {
        self.handle_rest
            .as_ref()
            .map_or(self.stack_bytes, |r| r.stack_bytes.max(self.stack_bytes))
    }
}

/// Spawns a thread that takes the container out of `slot`.
///
/// If spawning fails the container stays in `slot`.
fn launch(slot: &Slot, exit: Sender<Container>, relaunches: Arc<AtomicUsize>) -> io::Result<()> {
    let (name, stack) = match slot.lock().as_ref() {
        Some(c) => (c.name().to_owned(), c.launch_stack_bytes()),
        None => return Err(io::Error::other("container already launched")),
    };
    let taken = Arc::clone(slot);
    thread::Builder::new()
        .name(name)
        .stack_size(stack)
        .spawn(move || {
            let Some(container) = taken.lock().take() else {
                return;
            };
            thread_main(container, exit, relaunches);
        })?;
    Ok(())
}

fn thread_main(mut container: Container, exit: Sender<Container>, relaunches: Arc<AtomicUsize>) {
    loop {
        match container.run() {
            LoopExit::Terminated => {
                tracing::info!(name = container.name(), "container thread exiting");
                if exit.send(container).is_err() {
                    tracing::debug!("container handle dropped before exit");
                }
                return;
            }
            LoopExit::Relaunch => {
                relaunches.fetch_add(1, Ordering::AcqRel);
                let stack = container.launch_stack_bytes();
                tracing::info!(name = container.name(), stack, "relaunching container thread");
                let slot: Slot = Arc::new(Mutex::new(Some(container)));
                match launch(&slot, exit.clone(), Arc::clone(&relaunches)) {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::error!(error = %err, stack, "relaunch failed, staying on this thread");
                        let Some(c) = slot.lock().take() else {
                            return;
                        };
                        container = c;
                    }
                }
            }
        }
    }
}
