use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

/// Run `f` in a forked child and return its exit status. The child result
/// travels back as the status code, so keep it in 0..=255 and make 0 the
/// success case.
pub fn exit_status_in_child(f: impl FnOnce() -> i32) -> i32 {
    match unsafe { fork() }.expect("fork failed") {
        ForkResult::Child => {
            let code =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(101);
            // _exit instead of exit: do not run the parent's atexit handlers
            // or flush its stdio buffers twice
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None).expect("waitpid failed") {
                WaitStatus::Exited(_, code) => code,
                status => panic!("child did not exit cleanly: {status:?}"),
            }
        }
    }
}
