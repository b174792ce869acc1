//! Named counting semaphore over POSIX `sem_open`.
//!
//! The handle closes on drop but never unlinks; removal from the namespace
//! is an explicit, by-name operation so that the side of the protocol that
//! owns the name (cursor teardown, slot eviction, recovery) decides when the
//! semaphore disappears.

use std::ffi::CString;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct NamedSemaphore {
    handle: *mut libc::sem_t,
    name: String,
}

// The sem_t handle is process-wide; libc semaphore operations are
// thread-safe on a shared handle.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

enum OpenMode {
    Create,
    Open,
    OpenOrCreate,
}

impl NamedSemaphore {
    /// Creates a new semaphore, failing if one with this name exists.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        Self::with_mode(name, OpenMode::Create, initial)
    }

    /// Opens an existing semaphore, failing if none exists.
    pub fn open(name: &str) -> io::Result<Self> {
        Self::with_mode(name, OpenMode::Open, 0)
    }

    /// Opens the semaphore if it exists, creates it with `initial` otherwise.
    pub fn open_or_create(name: &str, initial: u32) -> io::Result<Self> {
        Self::with_mode(name, OpenMode::OpenOrCreate, initial)
    }

    fn with_mode(name: &str, mode: OpenMode, initial: u32) -> io::Result<Self> {
        let portable = Self::format_name(name);
        let c_name = CString::new(portable.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in semaphore name"))?;

        let handle = unsafe {
            match mode {
                OpenMode::Create => libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL,
                    0o644 as libc::c_uint,
                    initial,
                ),
                OpenMode::Open => libc::sem_open(c_name.as_ptr(), 0),
                OpenMode::OpenOrCreate => libc::sem_open(
                    c_name.as_ptr(),
                    libc::O_CREAT,
                    0o644 as libc::c_uint,
                    initial,
                ),
            }
        };

        if handle == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            handle,
            name: portable,
        })
    }

    /// Removes a named semaphore from the system namespace. Returns `true`
    /// if it was removed or did not exist.
    pub fn remove(name: &str) -> bool {
        let Ok(c_name) = CString::new(Self::format_name(name)) else {
            return false;
        };
        let rc = unsafe { libc::sem_unlink(c_name.as_ptr()) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::ENOENT)
    }

    /// Blocking acquire (decrements the count). Retries on signal interrupt.
    pub fn acquire(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.handle) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Non-blocking acquire. Returns `false` when the count is zero.
    pub fn try_acquire(&self) -> io::Result<bool> {
        if unsafe { libc::sem_trywait(self.handle) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(false),
            _ => Err(err),
        }
    }

    /// Timed acquire. Returns `false` on timeout.
    pub fn try_acquire_for(&self, timeout: Duration) -> io::Result<bool> {
        // sem_timedwait takes an absolute CLOCK_REALTIME deadline.
        let deadline = SystemTime::now() + timeout;
        let since_epoch = deadline
            .duration_since(UNIX_EPOCH)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "deadline before epoch"))?;
        let ts = libc::timespec {
            tv_sec: since_epoch.as_secs() as libc::time_t,
            tv_nsec: since_epoch.subsec_nanos() as libc::c_long,
        };

        loop {
            if unsafe { libc::sem_timedwait(self.handle, &ts) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Releases the semaphore `count` times (increments the count).
    pub fn release(&self, count: u32) -> io::Result<()> {
        for _ in 0..count {
            if unsafe { libc::sem_post(self.handle) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn format_name(name: &str) -> String {
        // POSIX semaphore names must start with exactly one '/'.
        format!("/{name}")
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.handle);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("shmbus_sem_test_{tag}_{}_{ts}", std::process::id())
    }

    #[test]
    fn create_release_acquire() {
        let name = unique_name("basic");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        assert!(!sem.try_acquire().unwrap());
        sem.release(2).unwrap();
        assert!(sem.try_acquire().unwrap());
        assert!(sem.try_acquire().unwrap());
        assert!(!sem.try_acquire().unwrap());

        assert!(NamedSemaphore::remove(&name));
    }

    #[test]
    fn create_fails_on_existing() {
        let name = unique_name("exclusive");
        let _sem = NamedSemaphore::create(&name, 0).unwrap();
        assert!(NamedSemaphore::create(&name, 0).is_err());
        assert!(NamedSemaphore::remove(&name));
    }

    #[test]
    fn timed_acquire_times_out() {
        let name = unique_name("timed");
        let sem = NamedSemaphore::create(&name, 0).unwrap();

        let start = std::time::Instant::now();
        assert!(!sem.try_acquire_for(Duration::from_millis(50)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(40));

        sem.release(1).unwrap();
        assert!(sem.try_acquire_for(Duration::from_millis(50)).unwrap());

        assert!(NamedSemaphore::remove(&name));
    }

    #[test]
    fn open_sees_releases_from_other_handle() {
        let name = unique_name("open");
        let creator = NamedSemaphore::create(&name, 0).unwrap();
        let opener = NamedSemaphore::open(&name).unwrap();

        creator.release(1).unwrap();
        assert!(opener.try_acquire().unwrap());

        assert!(NamedSemaphore::remove(&name));
    }

    #[test]
    fn remove_missing_is_ok() {
        assert!(NamedSemaphore::remove(&unique_name("missing")));
    }
}
