//! Process helpers shared across the workspace.
//!
//! - [`tokio_command`] builds child commands for supervised media tools.
//! - [`ProcessRegistry`] tracks in-flight child processes so they can be
//!   killed individually (timeouts) or all at once (shutdown).

mod registry;

pub use registry::{AlreadyRegistered, KillHandle, KillReport, ProcessRegistry, Registration};

#[cfg(feature = "tokio")]
pub use command::{NoWindowExt, tokio_command};

#[cfg(feature = "tokio")]
mod command {
    use std::ffi::OsStr;

    #[cfg(windows)]
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    /// Apply the Windows `CREATE_NO_WINDOW` flag. No-op elsewhere.
    pub trait NoWindowExt {
        fn no_window(&mut self);
    }

    impl NoWindowExt for tokio::process::Command {
        fn no_window(&mut self) {
            #[cfg(windows)]
            {
                use std::os::windows::process::CommandExt;
                self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
            }
        }
    }

    /// Create a `tokio::process::Command` suitable for long-running media tools.
    ///
    /// The child is killed if its handle is dropped, stdin is closed, and
    /// `CREATE_NO_WINDOW` is applied on Windows.
    pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(program);
        cmd.no_window();
        cmd.kill_on_drop(true);
        cmd.stdin(std::process::Stdio::null());
        cmd
    }
}
