// src/worker.rs
use crate::error::{SonataError, SonataResult};
use crate::http::HttpCode;
use crate::server::ServerContext;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// A connection that has fresh bytes to parse.
///
/// The generation pins the task to one occupant of the slot: if the reactor
/// closes the socket and the descriptor is reused before a worker gets here,
/// the task is dropped instead of touching the new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub fd: RawFd,
    pub generation: u64,
}

struct Queue {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed set of threads draining a FIFO of [`Task`]s.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads (at least one). With `pin_workers`, thread `i`
    /// is pinned to core `i % cores` when the platform exposes core ids.
    pub fn new(workers: usize, pin_workers: bool, ctx: Arc<ServerContext>) -> SonataResult<Self> {
        let workers = workers.max(1);
        let core_ids = if pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    tasks: VecDeque::new(),
                    shutdown: false,
                }),
                ready: Condvar::new(),
            }),
            handles: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);
            let shared = Arc::clone(&pool.shared);
            let ctx = Arc::clone(&ctx);

            let spawned = thread::Builder::new()
                .name(format!("sonata-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, core = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, core = id.id, "failed to pin worker");
                        }
                    }
                    run(&shared, &ctx);
                });

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                // Dropping the pool stops and joins the threads already started.
                Err(source) => return Err(SonataError::WorkerSpawn { index: i, source }),
            }
        }

        tracing::info!(workers, pinned = !core_ids.is_empty(), "worker pool started");
        Ok(pool)
    }

    /// Queue a task and wake one idle worker.
    pub fn append(&self, task: Task) {
        self.shared.lock().tasks.push_back(task);
        self.shared.ready.notify_one();
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Stop accepting work, wake everyone and join. Queued tasks are dropped.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            queue.tasks.clear();
        }
        self.shared.ready.notify_all();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared, ctx: &ServerContext) {
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = shared
                    .ready
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        };
        handle(ctx, task);
    }
}

fn handle(ctx: &ServerContext, task: Task) {
    let Some(mut conn) = ctx.table.get(task.fd) else {
        return;
    };
    if !conn.is_open() || conn.generation() != task.generation {
        tracing::trace!(fd = task.fd, "dropping stale task");
        return;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        conn.process(&ctx.epoll, &ctx.doc_root)
    }));

    match outcome {
        Ok(HttpCode::NoRequest) => {}
        Ok(_) => ctx.metrics.inc_req(),
        Err(_) => {
            tracing::error!(fd = task.fd, "request processing panicked, closing connection");
            conn.abort(&ctx.epoll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    fn context() -> (Arc<ServerContext>, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let ctx = ServerContext::new(root.path().to_path_buf(), 1024, 64).unwrap();
        (Arc::new(ctx), root)
    }

    fn wait_for_requests(ctx: &ServerContext, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.metrics.req_count.load(Ordering::Relaxed) < n {
            assert!(Instant::now() < deadline, "workers never processed the task");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn processes_queued_connection_and_skips_stale_tasks() {
        let (ctx, _root) = context();
        let pool = WorkerPool::new(1, false, Arc::clone(&ctx)).unwrap();
        assert_eq!(pool.workers(), 1);

        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let fd = server.into_raw_fd();

        let generation = {
            let mut conn = ctx.table.get(fd).unwrap();
            conn.init(fd, None, &ctx.epoll, ctx.table.live_counter()).unwrap();
            client.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
            assert!(conn.read());
            conn.generation()
        };

        pool.append(Task {
            fd,
            generation: generation + 1,
        });
        pool.append(Task { fd, generation });
        wait_for_requests(&ctx, 1);

        let conn = ctx.table.get(fd).unwrap();
        assert!(conn.response_head().starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(ctx.metrics.req_count.load(Ordering::Relaxed), 1);
        assert_eq!(pool.queued(), 0);
        drop(conn);

        let mut conn = ctx.table.get(fd).unwrap();
        assert!(conn.close_conn(&ctx.epoll, ctx.table.live_counter()));
    }

    #[test]
    fn tasks_for_unknown_descriptors_are_ignored() {
        let (ctx, _root) = context();
        let pool = WorkerPool::new(2, false, Arc::clone(&ctx)).unwrap();
        pool.append(Task {
            fd: 5000,
            generation: 1,
        });
        pool.append(Task {
            fd: 7,
            generation: 1,
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ctx.metrics.req_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let (ctx, _root) = context();
        let mut pool = WorkerPool::new(4, true, ctx).unwrap();
        assert_eq!(pool.workers(), 4);

        let started = Instant::now();
        pool.shutdown();
        assert_eq!(pool.workers(), 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        // Dropping after an explicit shutdown is a no-op.
        drop(pool);
    }
}
