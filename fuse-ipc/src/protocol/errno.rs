//! Translation of Linux errno numbers into host errno numbers.
//!
//! Daemons written against Linux headers report errors with Linux numbering.
//! When a session negotiates `linux_errnos`, response errors are mapped
//! through this table before they are correlated. On Linux hosts the table is
//! the identity for every entry.

/// Map a positive Linux errno to the host's value for the same condition.
///
/// Returns `None` for numbers with no host equivalent.
pub fn from_linux(errno: i32) -> Option<i32> {
    let host = match errno {
        1 => libc::EPERM,
        2 => libc::ENOENT,
        3 => libc::ESRCH,
        4 => libc::EINTR,
        5 => libc::EIO,
        6 => libc::ENXIO,
        7 => libc::E2BIG,
        8 => libc::ENOEXEC,
        9 => libc::EBADF,
        10 => libc::ECHILD,
        11 => libc::EAGAIN,
        12 => libc::ENOMEM,
        13 => libc::EACCES,
        14 => libc::EFAULT,
        15 => libc::ENOTBLK,
        16 => libc::EBUSY,
        17 => libc::EEXIST,
        18 => libc::EXDEV,
        19 => libc::ENODEV,
        20 => libc::ENOTDIR,
        21 => libc::EISDIR,
        22 => libc::EINVAL,
        23 => libc::ENFILE,
        24 => libc::EMFILE,
        25 => libc::ENOTTY,
        26 => libc::ETXTBSY,
        27 => libc::EFBIG,
        28 => libc::ENOSPC,
        29 => libc::ESPIPE,
        30 => libc::EROFS,
        31 => libc::EMLINK,
        32 => libc::EPIPE,
        33 => libc::EDOM,
        34 => libc::ERANGE,
        35 => libc::EDEADLK,
        36 => libc::ENAMETOOLONG,
        37 => libc::ENOLCK,
        38 => libc::ENOSYS,
        39 => libc::ENOTEMPTY,
        40 => libc::ELOOP,
        42 => libc::ENOMSG,
        43 => libc::EIDRM,
        71 => libc::EPROTO,
        74 => libc::EBADMSG,
        75 => libc::EOVERFLOW,
        84 => libc::EILSEQ,
        87 => libc::EUSERS,
        88 => libc::ENOTSOCK,
        89 => libc::EDESTADDRREQ,
        90 => libc::EMSGSIZE,
        91 => libc::EPROTOTYPE,
        92 => libc::ENOPROTOOPT,
        93 => libc::EPROTONOSUPPORT,
        94 => libc::ESOCKTNOSUPPORT,
        95 => libc::EOPNOTSUPP,
        96 => libc::EPFNOSUPPORT,
        97 => libc::EAFNOSUPPORT,
        98 => libc::EADDRINUSE,
        99 => libc::EADDRNOTAVAIL,
        100 => libc::ENETDOWN,
        101 => libc::ENETUNREACH,
        102 => libc::ENETRESET,
        103 => libc::ECONNABORTED,
        104 => libc::ECONNRESET,
        105 => libc::ENOBUFS,
        106 => libc::EISCONN,
        107 => libc::ENOTCONN,
        108 => libc::ESHUTDOWN,
        109 => libc::ETOOMANYREFS,
        110 => libc::ETIMEDOUT,
        111 => libc::ECONNREFUSED,
        112 => libc::EHOSTDOWN,
        113 => libc::EHOSTUNREACH,
        114 => libc::EALREADY,
        115 => libc::EINPROGRESS,
        116 => libc::ESTALE,
        122 => libc::EDQUOT,
        125 => libc::ECANCELED,
        _ => return None,
    };
    Some(host)
}

/// Translate a wire error (negated errno) from Linux numbering.
///
/// Zero passes through unchanged.
pub fn translate_wire_error(error: i32) -> Option<i32> {
    if error == 0 {
        return Some(0);
    }
    let positive = error.checked_neg()?;
    from_linux(positive).map(|host| -host)
}
