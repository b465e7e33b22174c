/// Error types that can be built from a plain message string.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait for `$err: FromMessage`.
///
/// `.context("loading jobs.json")` turns any `Result<T, impl Display>` or
/// `Option<T>` into `Result<T, $err>`, prefixing the source error.
///
/// ```ignore
/// // in crates/scheduler/src/error.rs
/// synchro_common::impl_context!(Error);
/// ```
#[macro_export]
macro_rules! impl_context {
    ($err:ty) => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $err>;

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $err>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $err> {
                let context = context.into();
                self.map_err(|e| {
                    <$err as $crate::FromMessage>::from_message(format!("{context}: {e}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $err>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|e| {
                    <$err as $crate::FromMessage>::from_message(format!("{}: {e}", f().into()))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> std::result::Result<T, $err> {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> std::result::Result<T, $err>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
