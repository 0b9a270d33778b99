use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};

/// One command to run under the supervisor.
///
/// After completion the descriptor is enriched in place: `started` and
/// `ended` are monotonic offsets from the supervisor's start, `status` is
/// the classic wait status word (exit code in the high byte, signal in the
/// low byte), and the captured output streams are inlined.
#[derive(Debug)]
pub struct Job {
    pub argv: Vec<String>,
    /// Reopen child stdin from this file before exec (pipe destinations).
    pub stdin_file: Option<std::path::PathBuf>,
    /// Caller-owned label carried through untouched.
    pub tag: String,

    pub started: Option<Duration>,
    pub ended: Option<Duration>,
    pub status: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Job {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin_file: None,
            tag: String::new(),
            started: None,
            ended: None,
            status: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn stdin_from(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

fn encode_status(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code << 8,
        None => status.signal().unwrap_or(0),
    }
}

type Callback<'a> = Box<dyn FnMut(&Job) + 'a>;

/// Bounded pool of child processes.
///
/// Single supervising thread; completions are drained at well-defined
/// points, so callbacks always observe a fully enriched descriptor. There
/// is no fairness guarantee across jobs and no mid-flight cancellation.
pub struct ParallelRun<'a> {
    max_jobs: usize,
    jobs: Vec<Job>,
    on_start: Option<Callback<'a>>,
    on_finish: Option<Callback<'a>>,
}

impl<'a> ParallelRun<'a> {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs: max_jobs.max(1),
            jobs: Vec::new(),
            on_start: None,
            on_finish: None,
        }
    }

    pub fn on_start(mut self, callback: impl FnMut(&Job) + 'a) -> Self {
        self.on_start = Some(Box::new(callback));
        self
    }

    pub fn on_finish(mut self, callback: impl FnMut(&Job) + 'a) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    /// Run every job, at most `max_jobs` concurrently, and block until the
    /// last one has finished. Per-job failures land in the descriptors;
    /// only a broken supervisor is an `Err`.
    pub fn run(mut self) -> Result<Vec<Job>> {
        let origin = Instant::now();
        let (tx, rx) = mpsc::channel::<(usize, std::io::Result<ExitStatus>)>();
        let mut captures: HashMap<usize, (File, File)> = HashMap::new();
        let mut next = 0;
        let mut running = 0;

        while next < self.jobs.len() || running > 0 {
            // Dead children first, then refill the pool.
            while let Ok((index, status)) = rx.try_recv() {
                Self::finish(
                    &mut self.jobs[index],
                    status,
                    captures.remove(&index),
                    origin,
                    &mut self.on_finish,
                );
                running -= 1;
            }

            while running < self.max_jobs && next < self.jobs.len() {
                let index = next;
                next += 1;
                match Self::start(&mut self.jobs[index], origin, &mut captures, index) {
                    Ok(mut child) => {
                        if let Some(callback) = self.on_start.as_mut() {
                            callback(&self.jobs[index]);
                        }
                        let tx = tx.clone();
                        thread::spawn(move || {
                            let status = child.wait();
                            let _ = tx.send((index, status));
                        });
                        running += 1;
                    }
                    Err(e) => {
                        // A job that cannot even spawn fails like one that
                        // exited non-zero; the pool keeps going.
                        let job = &mut self.jobs[index];
                        job.ended = Some(origin.elapsed());
                        job.status = Some(0x7F00);
                        job.stdout = Some(String::new());
                        job.stderr = Some(e.to_string());
                        if let Some(callback) = self.on_finish.as_mut() {
                            callback(job);
                        }
                    }
                }
            }

            if running == 0 {
                continue;
            }

            let (index, status) = rx
                .recv()
                .map_err(|_| Error::external("parallel supervisor", "worker channel closed"))?;
            Self::finish(
                &mut self.jobs[index],
                status,
                captures.remove(&index),
                origin,
                &mut self.on_finish,
            );
            running -= 1;
        }

        Ok(self.jobs)
    }

    fn start(
        job: &mut Job,
        origin: Instant,
        captures: &mut HashMap<usize, (File, File)>,
        index: usize,
    ) -> std::io::Result<std::process::Child> {
        let stdout = tempfile::tempfile()?;
        let stderr = tempfile::tempfile()?;

        let mut command = Command::new(&job.argv[0]);
        command
            .args(&job.argv[1..])
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?));

        match &job.stdin_file {
            Some(path) => command.stdin(Stdio::from(File::open(path)?)),
            None => command.stdin(Stdio::null()),
        };

        debug!("starting job: {:?}", job.argv);
        let child = command.spawn()?;
        job.started = Some(origin.elapsed());
        captures.insert(index, (stdout, stderr));
        Ok(child)
    }

    fn finish(
        job: &mut Job,
        status: std::io::Result<ExitStatus>,
        capture: Option<(File, File)>,
        origin: Instant,
        on_finish: &mut Option<Callback<'_>>,
    ) {
        job.ended = Some(origin.elapsed());
        job.status = Some(match status {
            Ok(status) => encode_status(status),
            Err(_) => 0x7F00,
        });

        if let Some((stdout, stderr)) = capture {
            job.stdout = Some(consume(stdout));
            job.stderr = Some(consume(stderr));
        }

        if let Some(callback) = on_finish.as_mut() {
            callback(job);
        }
    }
}

/// Read a capture file back from the start; the handle shared the child's
/// offset, and dropping it unlinks the temp file.
fn consume(mut file: File) -> String {
    let mut text = String::new();
    if file.rewind().is_ok() {
        let _ = file.read_to_string(&mut text);
    }
    text
}
