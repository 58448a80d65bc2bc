use std::io;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, STILL_ACTIVE};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, OpenThread, ResumeThread, SuspendThread, TerminateProcess,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, THREAD_SUSPEND_RESUME,
};

pub use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn open_process(pid: u32, access: u32) -> io::Result<OwnedHandle> {
    let handle = unsafe { OpenProcess(access, 0, pid) };
    if handle.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(OwnedHandle(handle))
    }
}

/// Apply `op` to every thread owned by `pid`. Returns how many threads were touched.
fn for_each_thread(pid: u32, op: unsafe fn(HANDLE) -> u32) -> io::Result<usize> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let snapshot = OwnedHandle(snapshot);

    let mut entry: THREADENTRY32 = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;

    let mut touched = 0usize;
    let mut ok = unsafe { Thread32First(snapshot.0, &mut entry) } != 0;
    while ok {
        if entry.th32OwnerProcessID == pid {
            let thread = unsafe { OpenThread(THREAD_SUSPEND_RESUME, 0, entry.th32ThreadID) };
            if !thread.is_null() {
                let thread = OwnedHandle(thread);
                if unsafe { op(thread.0) } != u32::MAX {
                    touched += 1;
                }
            }
        }
        ok = unsafe { Thread32Next(snapshot.0, &mut entry) } != 0;
    }

    if touched == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no threads of process {pid} could be opened"),
        ));
    }
    Ok(touched)
}

unsafe fn suspend_thread(handle: HANDLE) -> u32 {
    SuspendThread(handle)
}

unsafe fn resume_thread(handle: HANDLE) -> u32 {
    ResumeThread(handle)
}

pub fn suspend(pid: u32) -> io::Result<()> {
    for_each_thread(pid, suspend_thread).map(|_| ())
}

pub fn resume(pid: u32) -> io::Result<()> {
    for_each_thread(pid, resume_thread).map(|_| ())
}

/// No console-less graceful stop exists for a windowless child; this is the hard stop.
pub fn terminate(pid: u32) -> io::Result<()> {
    kill(pid)
}

pub fn kill(pid: u32) -> io::Result<()> {
    let process = open_process(pid, PROCESS_TERMINATE)?;
    if unsafe { TerminateProcess(process.0, 1) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_alive(pid: u32) -> bool {
    let Ok(process) = open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION) else {
        return false;
    };
    let mut code = 0u32;
    if unsafe { GetExitCodeProcess(process.0, &mut code) } == 0 {
        return false;
    }
    code == STILL_ACTIVE as u32
}
