//! The outward interface the engine provides. The orchestrator only ever
//! sees the video driver through these traits; the driver handle is shared
//! (reference counted) between every layer that talks to it.

use std::sync::Arc;

/// Windowing system the engine's GL context lives on, used only to validate
/// the graphics binding choice.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WindowSystem {
    Windows,
    X11,
    Other,
}

/// Pixel format for textures wrapped around swapchain images.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Argb8,
    Depth32f,
}

/// An engine texture created around a runtime-owned GL image.
pub trait Texture {
    fn size(&self) -> (u32, u32);
}

/// An engine framebuffer grouping a color texture and a depth texture.
///
/// The runtime acquires color and depth images independently, so the depth
/// attachment of a target is rebound on every acquisition.
pub trait RenderTarget {
    fn set_textures(&self, color: &Arc<dyn Texture>, depth: &Arc<dyn Texture>);
}

pub trait VideoDriver {
    fn window_system(&self) -> WindowSystem;

    /// Major/minor version of the live GL context.
    fn gl_version(&self) -> (u8, u8);

    /// Whether the live context is an OpenGL ES profile.
    fn is_gles(&self) -> bool;

    fn screen_size(&self) -> (u32, u32);

    fn add_render_target(&self) -> Arc<dyn RenderTarget>;

    /// Surrender a render target obtained from [`Self::add_render_target`].
    fn remove_render_target(&self, target: &Arc<dyn RenderTarget>);

    /// Wrap a GL texture name owned by the XR runtime into an engine
    /// texture.
    fn use_device_dependent_texture(
        &self,
        name: &str,
        image: u32,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Arc<dyn Texture>;
}
