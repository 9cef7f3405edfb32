// src/context.rs
//! `.context()` for `Result` and `Option`, plus the `bail!` / `ensure!`
//! macros. Everything lands in [`crate::error::Error`].

use crate::error::{Error, Result};

pub trait Context<T, E> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Lazy variant; the closure only runs on the error path.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// `Option<T>` to `Result<T>`, with the message as a [`Error::Custom`].
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::msg($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked_extent(width: u32, height: u32) -> Result<(u32, u32)> {
        ensure!(width > 0 && height > 0, "extent {}x{} has no area", width, height);
        Ok((width, height))
    }

    #[test]
    fn ensure_formats_its_message() {
        let err = checked_extent(0, 720).unwrap_err();
        assert_eq!(err.to_string(), "extent 0x720 has no area");
        assert_eq!(checked_extent(1280, 720).unwrap(), (1280, 720));
    }

    #[test]
    fn option_context_becomes_custom_error() {
        let missing: Option<u32> = None;
        let err = missing.with_context(|| format!("view `{}` not found", "minimap")).unwrap_err();
        assert_eq!(err.to_string(), "view `minimap` not found");
    }

    #[test]
    fn result_context_wraps_io_errors() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = io.context("reading phong.vert.wgsl").unwrap_err();
        assert!(matches!(err, Error::WithContext { .. }));
        assert!(err.to_string().starts_with("reading phong.vert.wgsl: I/O error"));
    }
}
