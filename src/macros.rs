//! Feature-gating macros used throughout the crate so that a caller who only
//! wants, say, the timer heap doesn't pull in TLS or HTTP dependencies.

macro_rules! cfg_os_poll {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "os-poll")]
            #[cfg_attr(docsrs, doc(cfg(feature = "os-poll")))]
            $item
        )*
    }
}

macro_rules! cfg_net {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "net")]
            #[cfg_attr(docsrs, doc(cfg(feature = "net")))]
            $item
        )*
    }
}

macro_rules! cfg_tls {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "tls")]
            #[cfg_attr(docsrs, doc(cfg(feature = "tls")))]
            $item
        )*
    }
}

macro_rules! cfg_http {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "http")]
            #[cfg_attr(docsrs, doc(cfg(feature = "http")))]
            $item
        )*
    }
}

macro_rules! cfg_websocket {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "websocket")]
            #[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
            $item
        )*
    }
}

macro_rules! cfg_resp {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "resp")]
            #[cfg_attr(docsrs, doc(cfg(feature = "resp")))]
            $item
        )*
    }
}

macro_rules! cfg_mqtt {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "mqtt")]
            #[cfg_attr(docsrs, doc(cfg(feature = "mqtt")))]
            $item
        )*
    }
}

macro_rules! cfg_coroutine {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "coroutine")]
            #[cfg_attr(docsrs, doc(cfg(feature = "coroutine")))]
            $item
        )*
    }
}

macro_rules! cfg_io_uring {
    ($($item:item)*) => {
        $(
            #[cfg(feature = "io-uring")]
            $item
        )*
    }
}

/// Panics with a consistent message when a backend required for the current
/// platform/feature combination was compiled out. Mirrors the pattern the
/// teacher crate uses for its `sys::shell` fallback implementations: a clear
/// runtime error rather than a silently-wrong no-op.
macro_rules! os_required {
    () => {
        panic!(
            "backend operation called without a supported I/O backend compiled in; \
             enable the `os-poll` feature, or a platform-specific backend feature, \
             for this target"
        )
    };
}
