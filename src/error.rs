use crate::driver::WindowSystem;
use log::error;
use openxr as xr;

/// Why connector creation failed. XR mode is unavailable for this launch;
/// the caller may retry a whole new connector later.
#[derive(Debug)]
pub enum InitError {
    EnumeratingExtensionsFailed(xr::sys::Result),
    MissingExtension(&'static str),
    InstanceCreationFailed(xr::sys::Result),
    SessionCreationFailed(SessionInitError),
}

impl From<SessionInitError> for InitError {
    fn from(value: SessionInitError) -> Self {
        Self::SessionCreationFailed(value)
    }
}

#[derive(Debug)]
pub enum SessionInitError {
    /// The host windowing system doesn't match the compiled graphics
    /// binding (GLX expects x11, WGL expects windows).
    UnexpectedWindowSystem(WindowSystem),
    /// Desktop GL binding with a GLES context, or vice versa.
    GlProfileMismatch,
    /// No GLX client library could be loaded.
    GlxUnavailable,
    /// No GL context is current on the calling thread.
    NoCurrentGlContext,
    GlVersionUnsupported {
        have: (u8, u8),
        min: xr::Version,
        max: xr::Version,
    },
    /// The runtime offers no usable depth swapchain format.
    NoDepthFormat,
    Xr(xr::sys::Result),
}

impl From<SessionLost> for SessionInitError {
    fn from(value: SessionLost) -> Self {
        Self::Xr(value.0)
    }
}

/// A runtime call failed mid-session. The session must be destroyed and
/// recreated on the retry cadence; the current frame yields no views.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SessionLost(pub xr::sys::Result);

/// Unwrap an XR call, logging a decoded failure. Failures are never
/// silently swallowed at the XR boundary.
pub(crate) fn check<T>(result: xr::Result<T>, what: &str) -> Result<T, SessionLost> {
    result.map_err(|err| {
        error!("{what} error: {err:?}");
        SessionLost(err)
    })
}

/// Variant of [`check`] for raw result codes, where a non-`SUCCESS`
/// qualified success (e.g. `TIMEOUT_EXPIRED`) must also be treated as
/// failure.
pub(crate) fn check_raw(result: xr::sys::Result, what: &str) -> Result<(), SessionLost> {
    if result == xr::sys::Result::SUCCESS {
        Ok(())
    } else {
        error!("{what} error: {result:?}");
        Err(SessionLost(result))
    }
}
