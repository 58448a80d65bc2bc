use std::io;

fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    // 0 and negative values address process groups.
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let pid = to_pid(pid)?;
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn suspend(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGSTOP)
}

pub fn resume(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGCONT)
}

/// SIGTERM, then SIGCONT so a stopped process can act on it.
pub fn terminate(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGTERM)?;
    let _ = signal(pid, libc::SIGCONT);
    Ok(())
}

pub fn kill(pid: u32) -> io::Result<()> {
    signal(pid, libc::SIGKILL)
}

pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = to_pid(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        // EPERM means it exists but belongs to someone else.
        return io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3, after the parenthesised command name (which may itself contain spaces).
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z" || state == "X")
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}
