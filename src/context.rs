//! Application context threaded through every command.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use plakar_cache::CacheManager;
use plakar_store::StoreRegistry;
use plakar_types::CancelToken;

use crate::events::EventBus;

pub struct AppContext {
    pub cancel: CancelToken,
    pub registry: StoreRegistry,
    pub cache: Arc<CacheManager>,
    pub events: Arc<EventBus>,
    pub secret: Option<String>,
    pub max_concurrency: usize,
    stdout: Mutex<Box<dyn Write + Send>>,
    stderr: Mutex<Box<dyn Write + Send>>,
}

impl AppContext {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            cancel: CancelToken::new(),
            registry: StoreRegistry::default(),
            cache,
            events: Arc::new(EventBus::new()),
            secret: None,
            max_concurrency: cpus * 8 + 1,
            stdout: Mutex::new(Box::new(std::io::stdout())),
            stderr: Mutex::new(Box::new(std::io::stderr())),
        }
    }

    /// Child context with its own cancellation scope and virtual writers;
    /// used by the agent for each client request.
    pub fn child(
        &self,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        secret: Option<String>,
    ) -> Self {
        Self {
            cancel: self.cancel.child(),
            registry: self.registry.clone(),
            cache: Arc::clone(&self.cache),
            events: Arc::new(EventBus::new()),
            secret,
            max_concurrency: self.max_concurrency,
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
        }
    }

    pub fn print(&self, text: &str) {
        let mut out = self.stdout.lock().unwrap();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub fn println(&self, line: &str) {
        let mut out = self.stdout.lock().unwrap();
        let _ = out.write_all(line.as_bytes());
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }

    pub fn eprintln(&self, line: &str) {
        let mut err = self.stderr.lock().unwrap();
        let _ = err.write_all(line.as_bytes());
        let _ = err.write_all(b"\n");
        let _ = err.flush();
    }

    /// Copy a reader to the client's stdout (used by `cat`).
    pub fn stream_stdout(&self, reader: &mut dyn std::io::Read) -> Result<u64, Error> {
        let mut out = self.stdout.lock().unwrap();
        let written = std::io::copy(reader, &mut *out)?;
        out.flush()?;
        Ok(written)
    }

    /// Passphrase provider for `Repository::open`.
    ///
    /// An explicit secret (RPC request or `PLAKAR_PASSPHRASE`) gets a
    /// single attempt; an interactive terminal gets three.
    pub fn unlock(&self) -> impl Fn(u32) -> Result<Option<String>, Error> + '_ {
        move |attempt| {
            if let Some(secret) = &self.secret {
                return Ok(if attempt == 0 {
                    Some(secret.clone())
                } else {
                    None
                });
            }
            if attempt >= 3 || !is_tty() {
                return Ok(None);
            }
            let passphrase = prompt_passphrase("repository passphrase: ")?;
            Ok(Some(passphrase))
        }
    }
}

fn is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

/// Read a passphrase from the controlling terminal with echo disabled.
pub fn prompt_passphrase(prompt: &str) -> Result<String, Error> {
    use std::io::BufRead;

    eprint!("{}", prompt);
    let _ = std::io::stderr().flush();

    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    let fd = libc::STDIN_FILENO;
    let restore = unsafe {
        if libc::tcgetattr(fd, termios.as_mut_ptr()) == 0 {
            let saved = termios.assume_init();
            let mut silent = saved;
            silent.c_lflag &= !libc::ECHO;
            libc::tcsetattr(fd, libc::TCSANOW, &silent);
            Some(saved)
        } else {
            None
        }
    };

    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line);

    if let Some(saved) = restore {
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &saved);
        }
        eprintln!();
    }

    read?;
    let passphrase = line.trim_end_matches('\n').to_string();
    if passphrase.is_empty() {
        bail!("empty passphrase");
    }
    Ok(passphrase)
}
