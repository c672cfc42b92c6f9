//! Mapping of filebox errors onto POSIX error numbers.

use filebox_proto::FsError;

/// The errno a filesystem call reports for `err`.
pub fn errno(err: &FsError) -> i32 {
    match err {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::InvalidHandle(_) => libc::EBADF,
        FsError::NotADirectory(_) => libc::ENOTDIR,
        FsError::IsADirectory(_) => libc::EISDIR,
        FsError::InvalidPath(_) => libc::EINVAL,
        FsError::Timeout => libc::ETIMEDOUT,
        FsError::IoFailure(_) | FsError::Disconnected | FsError::Protocol(_) => libc::EIO,
    }
}
