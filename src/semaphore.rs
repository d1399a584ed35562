//! Counting semaphores over POSIX unnamed, POSIX named or condvar backends.
//!
//! OS failures abort the process; only [`Semaphore::try_with_backend`]
//! reports them.

#[cfg(all(unix, not(target_vendor = "apple")))]
use std::cell::UnsafeCell;
#[cfg(unix)]
use std::ffi::{CStr, CString};
use std::{fmt, io};

use log::{error, trace};
#[cfg(unix)]
use rand::{distr::Alphanumeric, Rng};

/// Largest initial value every backend accepts (`SEM_VALUE_MAX` on Linux).
pub const MAX_VALUE: u32 = i32::MAX as u32;

/// The blocking primitive behind a [`Semaphore`].
pub trait RawSemaphore: Send + Sync {
    fn wait(&self) -> io::Result<()>;
    fn signal(&self) -> io::Result<()>;

    /// Releases any resource visible outside the process. Called right
    /// before a fatal abort, when `Drop` will not run.
    fn discard(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    Unnamed,
    Named,
    Portable,
}

impl Backend {
    pub fn native() -> Self {
        if cfg!(target_vendor = "apple") {
            Backend::Named
        } else if cfg!(unix) {
            Backend::Unnamed
        } else {
            Backend::Portable
        }
    }

    pub fn is_supported(self) -> bool {
        match self {
            Backend::Unnamed => cfg!(all(unix, not(target_vendor = "apple"))),
            Backend::Named => cfg!(unix),
            Backend::Portable => true,
        }
    }

    pub fn available() -> Vec<Backend> {
        [Backend::Unnamed, Backend::Named, Backend::Portable]
            .into_iter()
            .filter(|backend| backend.is_supported())
            .collect()
    }

    fn create(self, value: u32) -> io::Result<Box<dyn RawSemaphore>> {
        match self {
            #[cfg(all(unix, not(target_vendor = "apple")))]
            Backend::Unnamed => Ok(Box::new(UnnamedSemaphore::new(value)?)),
            #[cfg(unix)]
            Backend::Named => Ok(Box::new(NamedSemaphore::new(value)?)),
            Backend::Portable => Ok(Box::new(PortableSemaphore::new(value))),
            #[allow(unreachable_patterns)]
            unsupported => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{unsupported} semaphores are not available on this platform"),
            )),
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::native()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Unnamed => "unnamed",
            Backend::Named => "named",
            Backend::Portable => "portable",
        };
        f.write_str(name)
    }
}

/// A counting semaphore. Creation, `wait` and `signal` abort the process if
/// the OS primitive fails.
pub struct Semaphore {
    raw: Box<dyn RawSemaphore>,
    backend: Backend,
}

impl Semaphore {
    pub fn new(value: u32) -> Self {
        Self::with_backend(Backend::native(), value)
    }

    pub fn with_backend(backend: Backend, value: u32) -> Self {
        match Self::try_with_backend(backend, value) {
            Ok(sem) => sem,
            Err(err) => fatal("creating semaphore", &err),
        }
    }

    pub fn try_with_backend(backend: Backend, value: u32) -> io::Result<Self> {
        if value > MAX_VALUE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("semaphore value {value} exceeds {MAX_VALUE}"),
            ));
        }
        let raw = backend.create(value)?;
        trace!("created {backend} semaphore with value {value}");
        Ok(Self { raw, backend })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn wait(&self) {
        if let Err(err) = self.raw.wait() {
            self.raw.discard();
            fatal("waiting on semaphore", &err);
        }
    }

    pub fn signal(&self) {
        if let Err(err) = self.raw.signal() {
            self.raw.discard();
            fatal("signaling semaphore", &err);
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

fn fatal(context: &str, err: &io::Error) -> ! {
    if log::log_enabled!(log::Level::Error) {
        error!("{context}: {err}");
    } else {
        eprintln!("{context}: {err}");
    }
    std::process::abort();
}

#[cfg(all(unix, not(target_vendor = "apple")))]
pub struct UnnamedSemaphore {
    // sem_t must not move once initialized.
    sem: Box<UnsafeCell<libc::sem_t>>,
}

#[cfg(all(unix, not(target_vendor = "apple")))]
unsafe impl Send for UnnamedSemaphore {}
#[cfg(all(unix, not(target_vendor = "apple")))]
unsafe impl Sync for UnnamedSemaphore {}

#[cfg(all(unix, not(target_vendor = "apple")))]
impl UnnamedSemaphore {
    pub fn new(value: u32) -> io::Result<Self> {
        let sem = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        if unsafe { libc::sem_init(sem.get(), 0, value) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sem })
    }
}

#[cfg(all(unix, not(target_vendor = "apple")))]
impl RawSemaphore for UnnamedSemaphore {
    fn wait(&self) -> io::Result<()> {
        sem_wait_retrying(self.sem.get())
    }

    fn signal(&self) -> io::Result<()> {
        sem_post(self.sem.get())
    }
}

#[cfg(all(unix, not(target_vendor = "apple")))]
impl Drop for UnnamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_destroy(self.sem.get()) } == -1 {
            fatal("destroying semaphore", &io::Error::last_os_error());
        }
        trace!("destroyed unnamed semaphore");
    }
}

/// Named POSIX semaphore under a fresh exclusive name, unlinked on drop.
#[cfg(unix)]
pub struct NamedSemaphore {
    name: CString,
    sem: *mut libc::sem_t,
}

#[cfg(unix)]
unsafe impl Send for NamedSemaphore {}
#[cfg(unix)]
unsafe impl Sync for NamedSemaphore {}

#[cfg(unix)]
const NAME_ATTEMPTS: usize = 8;

#[cfg(unix)]
impl NamedSemaphore {
    pub fn new(value: u32) -> io::Result<Self> {
        let mut last_err = None;
        for _ in 0..NAME_ATTEMPTS {
            let name = unique_name()?;
            let sem = unsafe {
                libc::sem_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::c_uint,
                    value as libc::c_uint,
                )
            };
            if sem != libc::SEM_FAILED {
                return Ok(Self { name, sem });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::AlreadyExists {
                return Err(err);
            }
            last_err = Some(err);
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)))
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }
}

#[cfg(unix)]
fn unique_name() -> io::Result<CString> {
    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    CString::new(format!("/psem.{}.{token}", std::process::id()))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

#[cfg(unix)]
impl RawSemaphore for NamedSemaphore {
    fn wait(&self) -> io::Result<()> {
        sem_wait_retrying(self.sem)
    }

    fn signal(&self) -> io::Result<()> {
        sem_post(self.sem)
    }

    fn discard(&self) {
        unsafe { libc::sem_unlink(self.name.as_ptr()) };
    }
}

#[cfg(unix)]
impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        let closed = unsafe { libc::sem_close(self.sem) };
        if closed == -1 {
            let err = io::Error::last_os_error();
            self.discard();
            fatal("closing named semaphore", &err);
        }
        if unsafe { libc::sem_unlink(self.name.as_ptr()) } == -1 {
            fatal("unlinking named semaphore", &io::Error::last_os_error());
        }
        trace!("destroyed named semaphore {:?}", self.name);
    }
}

#[cfg(unix)]
fn sem_wait_retrying(sem: *mut libc::sem_t) -> io::Result<()> {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn sem_post(sem: *mut libc::sem_t) -> io::Result<()> {
    if unsafe { libc::sem_post(sem) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct PortableSemaphore {
    inner: std_semaphore::Semaphore,
}

impl PortableSemaphore {
    pub fn new(value: u32) -> Self {
        Self {
            inner: std_semaphore::Semaphore::new(value as isize),
        }
    }
}

impl RawSemaphore for PortableSemaphore {
    fn wait(&self) -> io::Result<()> {
        self.inner.acquire();
        Ok(())
    }

    fn signal(&self) -> io::Result<()> {
        self.inner.release();
        Ok(())
    }
}

/// Backends that can actually create a semaphore in this environment.
#[cfg(test)]
pub(crate) fn usable_backends() -> Vec<Backend> {
    Backend::available()
        .into_iter()
        .filter(|&backend| Semaphore::try_with_backend(backend, 1).is_ok())
        .collect()
}
