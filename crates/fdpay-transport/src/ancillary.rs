//! Raw `sendmsg`/`recvmsg` wrappers for `SCM_RIGHTS` descriptor passing.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::trace;

/// Kernel limit on descriptors in one `SCM_RIGHTS` message (`SCM_MAX_FD`).
pub const MAX_FDS_PER_MESSAGE: usize = 253;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

fn cmsg_space(fd_count: usize) -> usize {
    // SAFETY: CMSG_SPACE only computes a size from its argument.
    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// u64-backed so the buffer satisfies `cmsghdr` alignment.
fn control_buffer(fd_count: usize) -> Vec<u64> {
    vec![0u64; cmsg_space(fd_count).div_ceil(mem::size_of::<u64>())]
}

/// Send `data` with `fds` attached as ancillary data.
///
/// Returns the number of payload bytes the kernel accepted. The descriptors
/// are delivered together with the first of those bytes; a caller writing
/// the remainder must not attach them again.
pub fn send_with_fds(socket: BorrowedFd<'_>, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed SCM_MAX_FD ({MAX_FDS_PER_MESSAGE})", fds.len()),
        ));
    }
    if data.is_empty() && !fds.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "descriptors need at least one payload byte to travel with",
        ));
    }

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: msghdr is a plain C struct for which all-zero is a valid value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut control = Vec::new();
    if !fds.is_empty() {
        control = control_buffer(fds.len());
        msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = cmsg_space(fds.len()) as _;

        // SAFETY: msg_control points at a zeroed, u64-aligned buffer of at least
        // CMSG_SPACE(n * sizeof(int)) bytes, so the first header and its data
        // area for `fds.len()` descriptors lie inside it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as libc::c_uint) as _;
            let slots = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            for (i, fd) in fds.iter().enumerate() {
                slots.add(i).write_unaligned(fd.as_raw_fd());
            }
        }
    }

    loop {
        // SAFETY: `msg` references `iov` and `control`, both alive for the call,
        // and `socket` is an open descriptor borrowed for its duration.
        let rc = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, SEND_FLAGS) };
        if rc >= 0 {
            trace!(bytes = rc, fds = fds.len(), "sendmsg");
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive into `buf`, appending any passed descriptors to `fds`.
///
/// Returns the number of payload bytes read; `0` means the peer closed the
/// connection. If the kernel had to drop descriptors because the control
/// buffer was too small the call fails and the partial set is closed.
pub fn recv_with_fds(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut control = control_buffer(MAX_FDS_PER_MESSAGE);
    // SAFETY: msghdr is a plain C struct for which all-zero is a valid value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    let read = loop {
        // SAFETY: `msg` references `iov` (backed by `buf`) and `control`, both
        // writable and alive for the duration of the call.
        let rc = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if rc >= 0 {
            break rc as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut received = Vec::new();
    // SAFETY: the kernel filled `control` with `msg_controllen` bytes of
    // well-formed control messages; CMSG_FIRSTHDR/CMSG_NXTHDR stay within it.
    // Each SCM_RIGHTS descriptor is newly installed in this process and owned
    // by nobody else, so wrapping it in OwnedFd is sound.
    unsafe {
        let header_len = libc::CMSG_LEN(0) as usize;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header_len)
                    / mem::size_of::<RawFd>();
                let slots = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let raw = slots.add(i).read_unaligned();
                    if RECV_FLAGS == 0 {
                        libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC);
                    }
                    received.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::other(
            "control data truncated; passed descriptors were lost",
        ));
    }

    trace!(bytes = read, fds = received.len(), "recvmsg");
    fds.extend(received);
    Ok(read)
}
