//! Bounded execution of transfer worker operations.
//!
//! Connections are admitted without limit, but every storage operation goes through
//! a [`DispatchPool`] whose size caps how many run at once. Submissions beyond that
//! wait in line; there is no queue limit and no rejection.

use std::{
    ffi::OsString,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout},
    sync::{oneshot, Notify},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::PoolKind,
    error::TransferError,
    message::{
        decode_reply_body, decode_request_body, encode_reply, encode_request, Decode, ReqHeader,
        RespHeader, REQ_HEADER_SIZE, RESP_HEADER_SIZE,
    },
    storage::{Storage, WorkerOp, WorkerReply},
};

/// Runs transfer worker operations on a bounded set of workers.
///
/// `submit` blocks the caller until the operation has run and its reply is available.
#[async_trait]
pub trait DispatchPool: Send + Sync {
    async fn submit(&self, op: WorkerOp) -> Result<WorkerReply, TransferError>;

    /// Number of workers, i.e. the maximum number of operations running at once.
    fn size(&self) -> usize;

    fn kind(&self) -> PoolKind;
}

/// A unit of work for a pool thread.
struct Job {
    op: WorkerOp,
    done_tx: oneshot::Sender<WorkerReply>,
}

/// Worker threads sharing the server's address space.
pub struct WorkerPool {
    job_tx: flume::Sender<Job>,
    max_workers: usize,
}

impl WorkerPool {
    /// Start `max_workers` threads serving operations against `storage`.
    pub fn new(max_workers: usize, storage: Storage) -> Result<Self, TransferError> {
        let max_workers = max_workers.max(1);
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        for id in 0..max_workers {
            let job_rx = job_rx.clone();
            let storage = storage.clone();
            let _ = thread::Builder::new()
                .name(format!("transfer-worker-{id}"))
                .spawn(move || {
                    // Exits once every sender is gone.
                    while let Ok(job) = job_rx.recv() {
                        debug!("Worker {} running {}", id, job.op.name());
                        let reply = storage.execute(job.op);
                        if job.done_tx.send(reply).is_err() {
                            debug!("Worker {}: submitter went away", id);
                        }
                    }
                })?;
        }
        Ok(Self {
            job_tx,
            max_workers,
        })
    }

    /// Queue a job; the reply arrives on the job's channel.
    fn submit_job(&self, job: Job) -> Result<(), TransferError> {
        self.job_tx
            .send(job)
            .map_err(|_| TransferError::Pool("worker pool is shut down".to_string()))
    }
}

#[async_trait]
impl DispatchPool for WorkerPool {
    async fn submit(&self, op: WorkerOp) -> Result<WorkerReply, TransferError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit_job(Job { op, done_tx })?;
        done_rx
            .await
            .map_err(|_| TransferError::Pool("worker dropped the job".to_string()))
    }

    fn size(&self) -> usize {
        self.max_workers
    }

    fn kind(&self) -> PoolKind {
        PoolKind::Thread
    }
}

/// How to start an isolated worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg<A: Into<OsString>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run `program` in worker mode over the storage root at `root`.
    pub fn for_storage<P: Into<PathBuf>>(program: P, root: &Path) -> Self {
        Self::new(program)
            .arg("--worker")
            .arg("--storage-dir")
            .arg(root)
    }

    /// The running executable in worker mode over `root`.
    pub fn current_exe(root: &Path) -> Result<Self, TransferError> {
        Ok(Self::for_storage(std::env::current_exe()?, root))
    }
}

/// One isolated worker process and its request/reply pipes.
struct WorkerProcess {
    id: usize,
    seq: u64,
    stdin: ChildStdin,
    stdout: ChildStdout,
    // Killed when dropped.
    _child: Child,
}

impl WorkerProcess {
    /// Must be called from within a tokio runtime.
    fn spawn(id: usize, command: &WorkerCommand) -> Result<Self, TransferError> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TransferError::Pool(format!(
                    "could not start worker {}: {err}",
                    command.program.display()
                ))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransferError::Pool("could not access worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransferError::Pool("could not access worker stdout".to_string()))?;
        debug!("Started worker process {} (pid {:?})", id, child.id());
        Ok(Self {
            id,
            seq: 0,
            stdin,
            stdout,
            _child: child,
        })
    }

    /// One request/reply exchange.
    async fn call(&mut self, op: &WorkerOp) -> Result<WorkerReply, TransferError> {
        self.seq += 1;
        let packet = encode_request(self.seq, op);
        self.stdin.write_all(&packet).await.map_err(pipe_error)?;
        self.stdin.flush().await.map_err(pipe_error)?;

        let mut header = [0u8; RESP_HEADER_SIZE];
        let _ = self
            .stdout
            .read_exact(&mut header)
            .await
            .map_err(pipe_error)?;
        let header = RespHeader::decode(&header)?;
        if header.seq != self.seq {
            return Err(TransferError::Pool(format!(
                "worker {} answered request {} while {} was expected",
                self.id, header.seq, self.seq
            )));
        }
        let mut body = vec![0u8; header.len as usize];
        let _ = self
            .stdout
            .read_exact(&mut body)
            .await
            .map_err(pipe_error)?;
        decode_reply_body(header.resp_type, body)
    }
}

fn no_worker_left() -> TransferError {
    TransferError::Pool("no worker process left".to_string())
}

fn pipe_error(err: std::io::Error) -> TransferError {
    TransferError::Pool(format!("worker pipe: {err}"))
}

/// Worker processes isolated from the server; operations cross a pipe.
pub struct ProcessWorkerPool {
    command: WorkerCommand,
    idle_tx: flume::Sender<WorkerProcess>,
    idle_rx: flume::Receiver<WorkerProcess>,
    max_workers: usize,
    live: AtomicUsize,
    /// Signalled when the last worker is gone for good.
    exhausted: Notify,
}

impl ProcessWorkerPool {
    /// Start `max_workers` worker processes. Must be called from within a tokio runtime.
    pub fn new(max_workers: usize, command: WorkerCommand) -> Result<Self, TransferError> {
        let max_workers = max_workers.max(1);
        let (idle_tx, idle_rx) = flume::bounded(max_workers);
        for id in 0..max_workers {
            let worker = WorkerProcess::spawn(id, &command)?;
            idle_tx
                .try_send(worker)
                .map_err(|_| TransferError::Pool("idle queue is full".to_string()))?;
        }
        info!("Started {} worker processes", max_workers);
        Ok(Self {
            command,
            idle_tx,
            idle_rx,
            max_workers,
            live: AtomicUsize::new(max_workers),
            exhausted: Notify::new(),
        })
    }

    /// Hand a worker back to the idle queue.
    async fn release(&self, worker: WorkerProcess) {
        let id = worker.id;
        if let Err(err) = self.idle_tx.send_async(worker).await {
            debug!("Dropped worker process {}: {}", id, err);
        }
    }

    /// Replace a worker whose exchange failed.
    async fn replace(&self, id: usize) {
        match WorkerProcess::spawn(id, &self.command) {
            Ok(worker) => self.release(worker).await,
            Err(err) => {
                error!("Could not replace worker process {}: {}", id, err);
                if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
                    // Submissions parked on the idle queue would wait forever.
                    self.exhausted.notify_waiters();
                }
            }
        }
    }
}

#[async_trait]
impl DispatchPool for ProcessWorkerPool {
    async fn submit(&self, op: WorkerOp) -> Result<WorkerReply, TransferError> {
        let exhausted = self.exhausted.notified();
        tokio::pin!(exhausted);
        // Registered before the check so a notification in between is not lost.
        let _ = exhausted.as_mut().enable();
        if self.live.load(Ordering::SeqCst) == 0 {
            return Err(no_worker_left());
        }
        let mut worker = tokio::select! {
            biased;
            worker = self.idle_rx.recv_async() => worker
                .map_err(|_| TransferError::Pool("worker pool is shut down".to_string()))?,
            _ = &mut exhausted => return Err(no_worker_left()),
        };
        match worker.call(&op).await {
            Ok(reply) => {
                self.release(worker).await;
                Ok(reply)
            }
            Err(err) => {
                let id = worker.id;
                warn!("Worker process {} failed on {}: {}", id, op.name(), err);
                drop(worker);
                self.replace(id).await;
                Err(err)
            }
        }
    }

    fn size(&self) -> usize {
        self.max_workers
    }

    fn kind(&self) -> PoolKind {
        PoolKind::Process
    }
}

/// Build the pool selected at startup.
///
/// `command` is only used by [`PoolKind::Process`]; it defaults to the running
/// executable in worker mode.
pub fn build_pool(
    kind: PoolKind,
    max_workers: usize,
    storage: &Storage,
    command: Option<WorkerCommand>,
) -> Result<Arc<dyn DispatchPool>, TransferError> {
    Ok(match kind {
        PoolKind::Thread => Arc::new(WorkerPool::new(max_workers, storage.clone())?),
        PoolKind::Process => {
            let command = match command {
                Some(command) => command,
                None => WorkerCommand::current_exe(storage.root())?,
            };
            Arc::new(ProcessWorkerPool::new(max_workers, command)?)
        }
    })
}

/// Serve worker requests from `reader` until it is closed, writing replies to `writer`.
pub fn serve_worker_requests<R, W>(
    storage: &Storage,
    reader: R,
    writer: W,
) -> Result<(), TransferError>
where
    R: Read,
    W: Write,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    loop {
        let mut header = [0u8; REQ_HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("Request pipe closed");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        let header = ReqHeader::decode(&header)?;
        let mut body = vec![0u8; header.len as usize];
        reader.read_exact(&mut body)?;
        let op = decode_request_body(header.req_type, body)?;
        debug!("Request {}: {}", header.seq, op.name());

        let reply = storage.execute(op);
        writer.write_all(&encode_reply(header.seq, &reply))?;
        writer.flush()?;
    }
}

/// Entry point of a worker process: serve requests on stdin, reply on stdout.
pub fn run_worker_process(storage: &Storage) -> Result<(), TransferError> {
    info!(
        "Worker process {} serving {}",
        std::process::id(),
        storage.root().display()
    );
    serve_worker_requests(storage, std::io::stdin().lock(), std::io::stdout().lock())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::{RespType, RESP_HEADER_SIZE};

    #[tokio::test]
    async fn test_thread_pool_operations() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let pool = WorkerPool::new(2, storage).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.kind(), PoolKind::Thread);

        let reply = pool
            .submit(WorkerOp::Store {
                filename: "x.bin".to_string(),
                data: vec![1, 2, 3],
            })
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Stored);

        let reply = pool
            .submit(WorkerOp::Retrieve {
                filename: "x.bin".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(reply, WorkerReply::Content(vec![1, 2, 3]));

        let reply = pool.submit(WorkerOp::List).await.unwrap();
        assert_eq!(reply, WorkerReply::Listing("x.bin".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submissions_queue_behind_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let pool = Arc::new(WorkerPool::new(1, storage).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(WorkerOp::Store {
                    filename: format!("f{i}"),
                    data: vec![i as u8; 64],
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), WorkerReply::Stored);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 16);
    }

    #[test]
    fn test_serve_worker_requests() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let mut input = encode_request(
            1,
            &WorkerOp::Store {
                filename: "w.txt".to_string(),
                data: b"abc".to_vec(),
            },
        );
        input.extend(encode_request(
            2,
            &WorkerOp::Retrieve {
                filename: "nope".to_string(),
            },
        ));
        let mut output = Vec::new();
        serve_worker_requests(&storage, Cursor::new(input), &mut output).unwrap();

        let first = RespHeader::decode(&output).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.resp_type, RespType::Stored);
        let second = RespHeader::decode(&output[RESP_HEADER_SIZE..]).unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.resp_type, RespType::NotFound);
        assert_eq!(std::fs::read(dir.path().join("w.txt")).unwrap(), b"abc");
    }

    #[test]
    fn test_worker_command_for_storage() {
        let command = WorkerCommand::for_storage("/usr/bin/server", Path::new("/srv/files"));
        assert_eq!(command.program, PathBuf::from("/usr/bin/server"));
        assert_eq!(
            command.args,
            vec![
                OsString::from("--worker"),
                OsString::from("--storage-dir"),
                OsString::from("/srv/files")
            ]
        );
    }
}
