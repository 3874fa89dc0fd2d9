use std::io;

/// Build an [`io::Error`] from an errno code.
#[inline(always)]
pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Converts a C return value to a Rust `Result`.
///
/// libibverbs returns either `-errno` or `errno` depending on the verb, so the
/// sign is ignored.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(errno(ret.abs()))
    }
}

/// Converts a C return value to a Rust `Result`, with a verb-specific
/// explanation of the error code where one exists.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let code = ret.abs();
    match f(code) {
        Some(msg) => Err(io::Error::new(errno(code).kind(), msg)),
        None => Err(errno(code)),
    }
}

/// Whether an error returned by a post verb means the work queue is full.
#[inline]
pub(crate) fn is_queue_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOMEM)
}

/// Explain an error code returned by `ibv_post_send`.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
pub(crate) fn send_err_explanation(code: i32) -> Option<&'static str> {
    match code {
        libc::EINVAL => Some("invalid value provided in work request"),
        libc::ENOMEM => Some("send queue is full or not enough resources to complete this operation"),
        libc::EFAULT => Some("invalid value provided in queue pair"),
        _ => None,
    }
}

/// Explain an error code returned by `ibv_post_recv`.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
pub(crate) fn recv_err_explanation(code: i32) -> Option<&'static str> {
    match code {
        libc::EINVAL => Some("invalid value provided in work request"),
        libc::ENOMEM => Some("receive queue is full or not enough resources to complete this operation"),
        libc::EFAULT => Some("invalid value provided in queue pair"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_ret_sign_is_ignored() {
        assert!(from_c_ret(0).is_ok());
        assert_eq!(from_c_ret(-libc::EINVAL).unwrap_err().raw_os_error(), Some(libc::EINVAL));
        assert_eq!(from_c_ret(libc::EINVAL).unwrap_err().raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn explained_errors_keep_kind() {
        let err = from_c_ret_explained(libc::ENOMEM, send_err_explanation).unwrap_err();
        assert_eq!(err.kind(), errno(libc::ENOMEM).kind());
        assert!(err.to_string().contains("send queue is full"));
        assert!(is_queue_full(&errno(libc::ENOMEM)));
        assert!(!is_queue_full(&err));
    }
}
