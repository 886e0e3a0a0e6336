use crate::{
    driver::{Texture, TextureFormat, VideoDriver},
    error::{check, check_raw, SessionLost},
    graphics,
};
use log::info;
use openxr as xr;
use std::sync::Arc;

/// A ring of runtime-owned GL images for one eye (or the HUD), acquired one
/// at a time, with each image wrapped into an engine texture up front.
pub(crate) struct Swapchain {
    instance: xr::Instance,
    handle: xr::Swapchain<xr::OpenGL>,
    textures: Vec<Arc<dyn Texture>>,
    acquired: Option<usize>,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: &Arc<dyn VideoDriver>,
        instance: &xr::Instance,
        session: &xr::Session<xr::OpenGL>,
        usage_flags: xr::SwapchainUsageFlags,
        format: u32,
        sample_count: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, SessionLost> {
        let handle = check(
            session.create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags,
                format,
                sample_count,
                width,
                height,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
            }),
            "xrCreateSwapchain",
        )?;

        let images = check(handle.enumerate_images(), "xrEnumerateSwapchainImages")?;
        info!("Created swapchain of length {}", images.len());

        let texture_format = if usage_flags.contains(xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            TextureFormat::Depth32f
        } else {
            TextureFormat::Argb8
        };
        let textures = images
            .iter()
            .map(|&image| {
                driver.use_device_dependent_texture(
                    "openxr_swapchain",
                    image,
                    texture_format,
                    width,
                    height,
                )
            })
            .collect();

        Ok(Self {
            instance: instance.clone(),
            handle,
            textures,
            acquired: None,
        })
    }

    pub fn handle(&self) -> &xr::Swapchain<xr::OpenGL> {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Acquire the next image and wait for it to become usable. Must only
    /// be called inside a begun frame.
    pub fn acquire_and_wait(&mut self) -> Result<(), SessionLost> {
        assert!(self.acquired.is_none(), "swapchain image already acquired");
        let index = check(self.handle.acquire_image(), "xrAcquireSwapchainImage")? as usize;
        self.acquired = Some(index);

        // The wrapped wait_image treats TIMEOUT_EXPIRED as success, so go
        // through the raw entry point. Swapchains should almost never have
        // contention; sustained contention means the pipeline is broken and
        // tearing the session down is the only sane response.
        let wait_info = xr::sys::SwapchainImageWaitInfo {
            ty: xr::sys::SwapchainImageWaitInfo::TYPE,
            next: std::ptr::null_mut(),
            timeout: xr::sys::Duration::from_nanos(100_000_000),
        };
        let result = unsafe {
            (self.instance.fp().wait_swapchain_image)(self.handle.as_raw(), &wait_info)
        };
        check_raw(result, "xrWaitSwapchainImage")
    }

    pub fn acquired_index(&self) -> usize {
        self.acquired.expect("no swapchain image acquired")
    }

    pub fn acquired_texture(&self) -> &Arc<dyn Texture> {
        &self.textures[self.acquired_index()]
    }

    /// Hand the acquired image back to the runtime. Finishes GL work first
    /// so the rendered content is complete before layer submission.
    pub fn release(&mut self) -> Result<(), SessionLost> {
        assert!(self.acquired.is_some(), "no swapchain image to release");
        graphics::finish();
        check(self.handle.release_image(), "xrReleaseSwapchainImage")?;
        self.acquired = None;
        Ok(())
    }
}
