//! Capture of the host GL context for the session graphics binding.
//!
//! The engine and OpenXR don't know how to talk to each other; the raw
//! display/context handles have to be pulled from the underlying windowing
//! API, which must exactly match the one the engine is using:
//!
//!     Windows + OpenGL -> WGL
//!     X11 + OpenGL     -> GLX
//!     OpenGL ES        -> EGL (reserved)

use crate::driver::{VideoDriver, WindowSystem};
use crate::error::SessionInitError;
use openxr as xr;

pub(crate) use platform::{current_session_create_info, finish};

/// The windowing system the compiled graphics binding expects.
#[cfg(windows)]
pub(crate) const EXPECTED_WINDOW_SYSTEM: WindowSystem = WindowSystem::Windows;
#[cfg(not(windows))]
pub(crate) const EXPECTED_WINDOW_SYSTEM: WindowSystem = WindowSystem::X11;

/// Validate that the engine's context is compatible with the binding this
/// crate was built for.
pub(crate) fn verify_host_context(driver: &dyn VideoDriver) -> Result<(), SessionInitError> {
    let system = driver.window_system();
    if system != EXPECTED_WINDOW_SYSTEM {
        return Err(SessionInitError::UnexpectedWindowSystem(system));
    }
    if driver.is_gles() != cfg!(feature = "gles") {
        return Err(SessionInitError::GlProfileMismatch);
    }
    Ok(())
}

pub(crate) fn gl_version_of(driver: &dyn VideoDriver) -> xr::Version {
    let (major, minor) = driver.gl_version();
    xr::Version::new(major as u16, minor as u16, 0)
}

#[cfg(all(unix, not(target_os = "macos"), not(test)))]
mod platform {
    use crate::error::SessionInitError;
    use glutin_glx_sys::{
        glx::{self, Glx},
        Success,
    };
    use log::warn;
    use openxr as xr;
    use std::ffi::{c_int, c_void, CString};
    use std::sync::{Once, OnceLock};

    /// dlopen handle for the GLX client library. Modern distributions ship
    /// it standalone; older Mesa installs only expose it through libGL.
    fn glx_library() -> Option<*mut c_void> {
        static HANDLE: OnceLock<usize> = OnceLock::new();
        let handle = *HANDLE.get_or_init(|| {
            for name in [c"libGLX.so.0", c"libGL.so.1"] {
                let handle =
                    unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
                if !handle.is_null() {
                    return handle as usize;
                }
            }
            0
        });
        (handle != 0).then_some(handle as *mut c_void)
    }

    fn load_glx() -> Result<Glx, SessionInitError> {
        let library = glx_library().ok_or(SessionInitError::GlxUnavailable)?;
        Ok(Glx::load_with(|symbol| {
            let Ok(symbol) = CString::new(symbol) else {
                return std::ptr::null();
            };
            unsafe { libc::dlsym(library, symbol.as_ptr()) as *const c_void }
        }))
    }

    /// Build the Xlib session create info from the GL context current on
    /// this thread. Also loads the `gl` function pointers on first use.
    pub(crate) fn current_session_create_info(
    ) -> Result<xr::opengl::SessionCreateInfo, SessionInitError> {
        let glx = load_glx()?;

        static GL_ONCE: Once = Once::new();
        GL_ONCE.call_once(|| {
            gl::load_with(|symbol| match CString::new(symbol) {
                Ok(symbol) => unsafe { glx.GetProcAddress(symbol.as_ptr().cast()).cast() },
                Err(_) => std::ptr::null(),
            });
        });

        unsafe {
            let display = glx.GetCurrentDisplay();
            let context = glx.GetCurrentContext();
            if display.is_null() || context.is_null() {
                return Err(SessionInitError::NoCurrentGlContext);
            }
            let drawable = glx.GetCurrentDrawable();

            // The runtime wants the fbconfig the context was created from
            // alongside the bare handles. GLX doesn't hand it back
            // directly, so match the context's id against the screen's
            // config list.
            let mut fbconfig = None;
            let mut wanted = 0;
            let mut screen = 0;
            if glx.QueryContext(display, context, glx::FBCONFIG_ID as c_int, &mut wanted)
                == Success as c_int
                && glx.QueryContext(display, context, glx::SCREEN as c_int, &mut screen)
                    == Success as c_int
            {
                let mut count = 0;
                let configs = glx.GetFBConfigs(display, screen, &mut count);
                if !configs.is_null() && count > 0 {
                    // The X-allocated list is never freed; the matched
                    // handle has to stay valid for the session's lifetime.
                    fbconfig = std::slice::from_raw_parts(configs, count as usize)
                        .iter()
                        .copied()
                        .find(|&config| {
                            let mut id = 0;
                            glx.GetFBConfigAttrib(
                                display,
                                config,
                                glx::FBCONFIG_ID as c_int,
                                &mut id,
                            ) == Success as c_int
                                && id == wanted
                        });
                }
            }

            let visualid = match fbconfig {
                Some(config) => {
                    let mut id = 0;
                    glx.GetFBConfigAttrib(display, config, glx::VISUAL_ID as c_int, &mut id);
                    id as u32
                }
                None => {
                    warn!("Current GL context has no matching fbconfig");
                    0
                }
            };

            Ok(xr::opengl::SessionCreateInfo::Xlib {
                x_display: display.cast(),
                glx_fb_config: fbconfig
                    .map(|config| config.cast_mut())
                    .unwrap_or(std::ptr::null_mut()),
                visualid,
                glx_drawable: drawable,
                glx_context: context.cast_mut(),
            })
        }
    }

    /// Block until queued GL work completes. Required before releasing a
    /// swapchain image so the GPU work precedes layer submission.
    pub(crate) fn finish() {
        unsafe { gl::Finish() };
    }
}

#[cfg(all(windows, not(test)))]
mod platform {
    use crate::error::SessionInitError;
    use openxr as xr;
    use std::ffi::c_void;

    #[link(name = "opengl32")]
    extern "system" {
        fn wglGetCurrentDC() -> *mut c_void;
        fn wglGetCurrentContext() -> *mut c_void;
    }

    pub(crate) fn current_session_create_info(
    ) -> Result<xr::opengl::SessionCreateInfo, SessionInitError> {
        unsafe {
            let h_dc = wglGetCurrentDC();
            let h_glrc = wglGetCurrentContext();
            if h_dc.is_null() || h_glrc.is_null() {
                return Err(SessionInitError::NoCurrentGlContext);
            }
            Ok(xr::opengl::SessionCreateInfo::Windows { h_dc, h_glrc })
        }
    }

    pub(crate) fn finish() {
        unsafe { gl::Finish() };
    }
}

// Under test there is no live GL context; the fake runtime never
// dereferences the binding.
#[cfg(test)]
mod platform {
    use crate::error::SessionInitError;
    use openxr as xr;

    pub(crate) fn current_session_create_info(
    ) -> Result<xr::opengl::SessionCreateInfo, SessionInitError> {
        Ok(xr::opengl::SessionCreateInfo::Xlib {
            x_display: std::ptr::null_mut(),
            glx_fb_config: std::ptr::null_mut(),
            visualid: 0,
            glx_drawable: 0,
            glx_context: std::ptr::null_mut(),
        })
    }

    pub(crate) fn finish() {}
}
