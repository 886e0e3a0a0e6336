use crate::{
    driver::{RenderTarget, VideoDriver},
    error::{check, SessionInitError, SessionLost},
    graphics,
    input::Input,
    math,
    swapchain::Swapchain,
    types::{FrameConfig, InputState, ViewInfo, ViewKind},
};
use glam::{Quat, Vec3};
use log::{error, info, warn};
use openxr as xr;
use std::sync::Arc;

const VIEW_TYPE: xr::ViewConfigurationType = xr::ViewConfigurationType::PRIMARY_STEREO;

const Z_NEAR: f32 = 1.0;
const Z_FAR: f32 = 20000.0;

// HUD dimensions used until the first frame config arrives.
const DEFAULT_HUD_WIDTH: u32 = 1280;
const DEFAULT_HUD_HEIGHT: u32 = 1024;

/// Depth layer data for `XR_KHR_composition_layer_depth`, kept alongside
/// each view chain.
// TODO: chain this into the projection views' `next` pointers; doing so
// currently breaks SteamVR.
#[allow(dead_code)]
struct DepthLayerInfo {
    min_depth: f32,
    max_depth: f32,
    near_z: f32,
    far_z: f32,
    extent: xr::Extent2Di,
}

/// Color and depth swapchains for one eye, plus the lazily created render
/// targets for each color image.
///
/// A render target groups a framebuffer, color texture, and depth texture,
/// but the runtime acquires color and depth images independently and their
/// association is not stable. Each target stays bound to a fixed color
/// texture; its depth texture is rebound on every acquisition.
struct ViewChain {
    color: Swapchain,
    depth: Swapchain,
    targets: Vec<Option<Arc<dyn RenderTarget>>>,
    depth_info: DepthLayerInfo,
}

struct HudChain {
    color: Swapchain,
    depth: Swapchain,
    targets: Vec<Option<Arc<dyn RenderTarget>>>,
    width: u32,
    height: u32,
}

impl HudChain {
    fn new(
        driver: &Arc<dyn VideoDriver>,
        instance: &xr::Instance,
        session: &xr::Session<xr::OpenGL>,
        color_format: u32,
        depth_format: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, SessionLost> {
        let color = Swapchain::new(
            driver,
            instance,
            session,
            xr::SwapchainUsageFlags::SAMPLED | xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
            color_format,
            1,
            width,
            height,
        )?;
        let depth = Swapchain::new(
            driver,
            instance,
            session,
            xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_format,
            1,
            width,
            height,
        )?;
        let targets = vec![None; color.len()];
        Ok(Self {
            color,
            depth,
            targets,
            width,
            height,
        })
    }
}

/// Where the view iterator stands within the current frame.
enum ViewCursor {
    Eye(usize),
    Done,
}

/// State that is only meaningful between `xrBeginFrame` and `xrEndFrame`.
struct ActiveFrame {
    config: FrameConfig,
    render_hud: bool,
    should_render: bool,
    cursor: ViewCursor,
    views: Vec<xr::View>,
    view_center: xr::Vector3f,
}

pub(crate) struct Session {
    driver: Arc<dyn VideoDriver>,
    instance: xr::Instance,
    session: xr::Session<xr::OpenGL>,
    waiter: xr::FrameWaiter,
    stream: xr::FrameStream<xr::OpenGL>,

    view_configs: Vec<xr::ViewConfigurationView>,
    color_format: u32,
    depth_format: u32,

    play_space_type: xr::ReferenceSpaceType,
    // BasePlaySpace never moves; PlaySpace carries the recenter offset and
    // is recreated whenever the offset changes.
    base_play_space: xr::Space,
    play_space: xr::Space,
    view_space: xr::Space,
    play_space_offset: xr::Posef,
    do_recenter: bool,

    view_chains: Vec<ViewChain>,
    hud_chain: HudChain,

    input: Input,

    state: xr::SessionState,
    running: bool,
    app_ready: bool,
    did_wait_frame: bool,
    frame_state: Option<xr::FrameState>,
    frame: Option<ActiveFrame>,
}

impl Session {
    pub fn new(
        instance: &xr::Instance,
        driver: Arc<dyn VideoDriver>,
        play_space_type: xr::ReferenceSpaceType,
    ) -> Result<Self, SessionInitError> {
        let system = check(
            instance.system(xr::FormFactor::HEAD_MOUNTED_DISPLAY),
            "xrGetSystem",
        )?;
        log_system(instance, system)?;
        log_view_configurations(instance, system)?;

        let view_configs = check(
            instance.enumerate_view_configuration_views(system, VIEW_TYPE),
            "xrEnumerateViewConfigurationViews",
        )?;
        info!("Using stereo view");
        for (i, conf) in view_configs.iter().enumerate() {
            info!(
                "View {i}: Recommended/Max Resolution {}x{}/{}x{}, Swapchain samples {}/{}",
                conf.recommended_image_rect_width,
                conf.recommended_image_rect_height,
                conf.max_image_rect_width,
                conf.max_image_rect_height,
                conf.recommended_swapchain_sample_count,
                conf.max_swapchain_sample_count,
            );
        }

        verify_graphics(instance, system, &*driver)?;

        // OpenXR can't reach the engine's GL context on its own; the raw
        // handles are pulled from the windowing API and must match it
        // exactly.
        let binding = graphics::current_session_create_info()?;
        let (session, waiter, stream) = check(
            unsafe { instance.create_session::<xr::OpenGL>(system, &binding) },
            "xrCreateSession",
        )?;

        let play_space_offset = xr::Posef::IDENTITY;
        let base_play_space = check(
            session.create_reference_space(play_space_type, xr::Posef::IDENTITY),
            "xrCreateReferenceSpace",
        )?;
        let play_space = check(
            session.create_reference_space(play_space_type, play_space_offset),
            "xrCreateReferenceSpace",
        )?;
        let view_space = check(
            session.create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY),
            "xrCreateReferenceSpace",
        )?;

        let (color_format, depth_format) = choose_formats(&session)?;

        let mut view_chains = Vec::with_capacity(view_configs.len());
        for conf in &view_configs {
            let width = conf.recommended_image_rect_width;
            let height = conf.recommended_image_rect_height;
            let color = Swapchain::new(
                &driver,
                instance,
                &session,
                xr::SwapchainUsageFlags::SAMPLED | xr::SwapchainUsageFlags::COLOR_ATTACHMENT,
                color_format,
                conf.recommended_swapchain_sample_count,
                width,
                height,
            )?;
            let depth = Swapchain::new(
                &driver,
                instance,
                &session,
                xr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                depth_format,
                conf.recommended_swapchain_sample_count,
                width,
                height,
            )?;
            let targets = vec![None; color.len()];
            view_chains.push(ViewChain {
                color,
                depth,
                targets,
                depth_info: DepthLayerInfo {
                    min_depth: 0.0,
                    max_depth: 1.0,
                    near_z: Z_NEAR,
                    far_z: Z_FAR,
                    extent: xr::Extent2Di {
                        width: width as i32,
                        height: height as i32,
                    },
                },
            });
        }

        let hud_chain = HudChain::new(
            &driver,
            instance,
            &session,
            color_format,
            depth_format,
            DEFAULT_HUD_WIDTH,
            DEFAULT_HUD_HEIGHT,
        )?;

        let input = Input::new(instance, &session)?;

        Ok(Self {
            driver,
            instance: instance.clone(),
            session,
            waiter,
            stream,
            view_configs,
            color_format,
            depth_format,
            play_space_type,
            base_play_space,
            play_space,
            view_space,
            play_space_offset,
            do_recenter: false,
            view_chains,
            hud_chain,
            input,
            state: xr::SessionState::IDLE,
            running: false,
            app_ready: false,
            did_wait_frame: false,
            frame_state: None,
            frame: None,
        })
    }

    /// Returns false when the session cannot satisfy the request and must
    /// be destroyed: `xrEndSession` is only portably callable from
    /// `STOPPING`, so stopping a running session means tearing it down.
    pub fn set_app_ready(&mut self, ready: bool) -> bool {
        assert!(self.frame.is_none(), "set_app_ready during a frame");
        self.app_ready = ready;
        !(self.running && !ready)
    }

    /// Schedule a recenter before the next rendered frame.
    pub fn recenter(&mut self) {
        self.do_recenter = true;
    }

    pub fn input_state(&self) -> InputState {
        self.input.state()
    }

    pub fn handle_state_change(
        &mut self,
        event_session: xr::sys::Session,
        state: xr::SessionState,
    ) -> Result<(), SessionLost> {
        if event_session != self.session.as_raw() {
            // Stale message; not sure this can actually happen.
            info!("Received stale session state change");
            return Ok(());
        }
        info!("Session state changed to {state:?}");
        self.state = state;
        if state == xr::SessionState::STOPPING {
            self.end_session()?;
        }
        Ok(())
    }

    fn begin_session(&mut self) -> Result<(), SessionLost> {
        assert!(!self.running);
        check(self.session.begin(VIEW_TYPE), "xrBeginSession")?;
        self.running = true;
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), SessionLost> {
        assert!(self.running);
        assert!(self.frame.is_none());
        assert_eq!(self.state, xr::SessionState::STOPPING);
        check(self.session.end(), "xrEndSession")?;
        self.running = false;
        self.did_wait_frame = false;
        self.frame_state = None;
        Ok(())
    }

    /// Block until the runtime wants the next frame, then refresh the input
    /// snapshot for its predicted display time.
    fn wait_frame(&mut self) -> Result<(), SessionLost> {
        assert!(!self.did_wait_frame);
        let frame_state = check(self.waiter.wait(), "xrWaitFrame")?;
        let display_time = frame_state.predicted_display_time;
        self.did_wait_frame = true;
        self.frame_state = Some(frame_state);
        self.input.sync(display_time, &self.play_space)
    }

    pub fn try_begin_frame(&mut self, config: &FrameConfig) -> Result<bool, SessionLost> {
        assert!(self.frame.is_none(), "frame already in flight");
        // The app must only submit frames between start_xr and stop_xr.
        assert!(self.app_ready, "frame outside start/stop");

        if !self.running {
            if self.state != xr::SessionState::READY {
                return Ok(false);
            }
            self.begin_session()?;
            self.wait_frame()?;
        }
        assert!(self.did_wait_frame);
        let (should_render_hint, display_time) = {
            let frame_state = self.frame_state.as_ref().expect("frame waited without state");
            (frame_state.should_render, frame_state.predicted_display_time)
        };

        let render_hud = config.floating_hud.enable;
        if render_hud
            && (config.hud_size.0 != self.hud_chain.width
                || config.hud_size.1 != self.hud_chain.height)
        {
            self.rebuild_hud_chain(config.hud_size)?;
        }

        check(self.stream.begin(), "xrBeginFrame")?;

        if self.do_recenter && should_render_hint {
            self.do_recenter = false;
            self.recenter_play_space(display_time)?;
        }

        let (flags, views) = check(
            self.session
                .locate_views(VIEW_TYPE, display_time, &self.play_space),
            "xrLocateViews",
        )?;
        assert_eq!(views.len(), self.view_configs.len());

        let mut should_render = should_render_hint;
        if !flags.contains(xr::ViewStateFlags::POSITION_VALID)
            || !flags.contains(xr::ViewStateFlags::ORIENTATION_VALID)
        {
            should_render = false;
        }

        let view_center = if should_render {
            match views.len() {
                0 => xr::Vector3f::default(),
                1 => views[0].pose.position,
                _ => midpoint(views[0].pose.position, views[1].pose.position),
            }
        } else {
            xr::Vector3f::default()
        };

        self.frame = Some(ActiveFrame {
            config: *config,
            render_hud,
            should_render,
            cursor: ViewCursor::Eye(0),
            views,
            view_center,
        });
        Ok(true)
    }

    /// Yield the next view of the frame, or end the frame and return `None`.
    pub fn next_view(&mut self) -> Result<Option<ViewInfo>, SessionLost> {
        let frame = self.frame.as_ref().expect("next_view outside a frame");
        if !frame.should_render {
            // The frame must still be begun and ended; there's just nothing
            // to draw and no layers to submit.
            self.finish_frame()?;
            return Ok(None);
        }
        match frame.cursor {
            ViewCursor::Eye(index) if index < self.view_chains.len() => {
                let view = frame.views[index];
                let center = frame.view_center;
                let info = self.acquire_eye_view(index, view, center)?;
                self.frame.as_mut().unwrap().cursor = ViewCursor::Eye(index + 1);
                Ok(Some(info))
            }
            ViewCursor::Eye(_) if frame.render_hud => {
                let info = self.acquire_hud_view()?;
                self.frame.as_mut().unwrap().cursor = ViewCursor::Done;
                Ok(Some(info))
            }
            _ => {
                let render_hud = frame.render_hud;
                self.release_swapchains(render_hud)?;
                self.finish_frame()?;
                Ok(None)
            }
        }
    }

    fn acquire_eye_view(
        &mut self,
        index: usize,
        view: xr::View,
        center: xr::Vector3f,
    ) -> Result<ViewInfo, SessionLost> {
        let chain = &mut self.view_chains[index];
        chain.color.acquire_and_wait()?;
        chain.depth.acquire_and_wait()?;

        let slot = &mut chain.targets[chain.color.acquired_index()];
        let target = match slot {
            Some(target) => target.clone(),
            None => {
                info!("Adding render target");
                let target = self.driver.add_render_target();
                *slot = Some(target.clone());
                target
            }
        };
        target.set_textures(chain.color.acquired_texture(), chain.depth.acquired_texture());

        let conf = &self.view_configs[index];
        Ok(ViewInfo {
            kind: if index == 0 {
                ViewKind::LeftEye
            } else {
                ViewKind::RightEye
            },
            target,
            width: conf.recommended_image_rect_width,
            height: conf.recommended_image_rect_height,
            position: math::vec_from_xr(view.pose.position),
            orientation: math::eye_orientation(view.pose.orientation),
            position_base: math::vec_from_xr(center),
            angle_left: view.fov.angle_left,
            angle_right: view.fov.angle_right,
            angle_up: view.fov.angle_up,
            angle_down: view.fov.angle_down,
            z_near: Z_NEAR,
            z_far: Z_FAR,
        })
    }

    fn acquire_hud_view(&mut self) -> Result<ViewInfo, SessionLost> {
        let chain = &mut self.hud_chain;
        chain.color.acquire_and_wait()?;
        chain.depth.acquire_and_wait()?;

        let slot = &mut chain.targets[chain.color.acquired_index()];
        let target = match slot {
            Some(target) => target.clone(),
            None => {
                info!("Adding render target");
                let target = self.driver.add_render_target();
                *slot = Some(target.clone());
                target
            }
        };
        target.set_textures(chain.color.acquired_texture(), chain.depth.acquired_texture());

        Ok(ViewInfo {
            kind: ViewKind::Hud,
            target,
            width: chain.width,
            height: chain.height,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            position_base: Vec3::ZERO,
            // Not meaningful for the HUD quad.
            angle_left: -45.0,
            angle_right: 45.0,
            angle_up: 45.0,
            angle_down: -45.0,
            z_near: 1.0,
            z_far: 10.0,
        })
    }

    fn release_swapchains(&mut self, render_hud: bool) -> Result<(), SessionLost> {
        for chain in &mut self.view_chains {
            chain.color.release()?;
            chain.depth.release()?;
        }
        if render_hud {
            self.hud_chain.color.release()?;
            self.hud_chain.depth.release()?;
        }
        Ok(())
    }

    /// Submit the frame's layers, then immediately wait for the next frame
    /// so CPU work overlaps with the runtime.
    fn finish_frame(&mut self) -> Result<(), SessionLost> {
        let frame = self.frame.take().expect("ending a frame that never began");
        let frame_state = self.frame_state.take().expect("frame ended without wait");

        {
            let mut projection_views = Vec::new();
            if frame.should_render {
                for (index, view) in frame.views.iter().enumerate() {
                    let chain = &self.view_chains[index];
                    let conf = &self.view_configs[index];
                    projection_views.push(
                        xr::CompositionLayerProjectionView::new()
                            .pose(view.pose)
                            .fov(view.fov)
                            .sub_image(
                                xr::SwapchainSubImage::new()
                                    .swapchain(chain.color.handle())
                                    .image_array_index(0)
                                    .image_rect(xr::Rect2Di {
                                        offset: xr::Offset2Di::default(),
                                        extent: xr::Extent2Di {
                                            width: conf.recommended_image_rect_width as i32,
                                            height: conf.recommended_image_rect_height as i32,
                                        },
                                    }),
                            ),
                    );
                }
            }

            let projection;
            let quad;
            let mut layers: Vec<&xr::CompositionLayerBase<xr::OpenGL>> = Vec::new();
            if frame.should_render {
                projection = xr::CompositionLayerProjection::new()
                    .space(&self.play_space)
                    .views(&projection_views);
                layers.push(&projection);

                if frame.render_hud {
                    let hud = &frame.config.floating_hud;
                    quad = xr::CompositionLayerQuad::new()
                        .layer_flags(
                            xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA
                                | xr::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA,
                        )
                        .space(&self.play_space)
                        .eye_visibility(xr::EyeVisibility::BOTH)
                        .pose(xr::Posef {
                            orientation: math::quat_to_xr(hud.orientation),
                            position: math::vec_to_xr(hud.position),
                        })
                        .size(math::extent_to_xr(hud.size))
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(self.hud_chain.color.handle())
                                .image_array_index(0)
                                .image_rect(xr::Rect2Di {
                                    offset: xr::Offset2Di::default(),
                                    extent: xr::Extent2Di {
                                        width: self.hud_chain.width as i32,
                                        height: self.hud_chain.height as i32,
                                    },
                                }),
                        );
                    layers.push(&quad);
                }
            }

            check(
                self.stream.end(
                    frame_state.predicted_display_time,
                    xr::EnvironmentBlendMode::OPAQUE,
                    &layers,
                ),
                "xrEndFrame",
            )?;
        }

        self.did_wait_frame = false;
        self.wait_frame()
    }

    /// Rebase the play space so the current head position and yaw become
    /// the origin. Pitch and roll are deliberately dropped; the runtime
    /// keeps the XZ plane parallel to the floor.
    fn recenter_play_space(&mut self, time: xr::Time) -> Result<(), SessionLost> {
        let location = check(
            self.view_space.locate(&self.base_play_space, time),
            "xrLocateSpace",
        )?;
        let flags = location.location_flags;
        if !flags.contains(xr::SpaceLocationFlags::POSITION_VALID)
            || !flags.contains(xr::SpaceLocationFlags::ORIENTATION_VALID)
        {
            // Quietly do nothing on incomplete data.
            return Ok(());
        }

        let yaw = math::yaw_of(location.pose.orientation);
        self.play_space_offset = xr::Posef {
            position: location.pose.position,
            orientation: math::yaw_quat_xr(yaw),
        };
        self.play_space = check(
            self.session
                .create_reference_space(self.play_space_type, self.play_space_offset),
            "xrCreateReferenceSpace",
        )?;
        self.view_space = check(
            self.session
                .create_reference_space(xr::ReferenceSpaceType::VIEW, xr::Posef::IDENTITY),
            "xrCreateReferenceSpace",
        )?;
        Ok(())
    }

    fn rebuild_hud_chain(&mut self, (width, height): (u32, u32)) -> Result<(), SessionLost> {
        surrender_targets(&self.driver, &mut self.hud_chain.targets);
        self.hud_chain = HudChain::new(
            &self.driver,
            &self.instance,
            &self.session,
            self.color_format,
            self.depth_format,
            width,
            height,
        )?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for chain in &mut self.view_chains {
            surrender_targets(&self.driver, &mut chain.targets);
        }
        surrender_targets(&self.driver, &mut self.hud_chain.targets);
    }
}

/// Render targets come from the engine driver and must be handed back.
fn surrender_targets(driver: &Arc<dyn VideoDriver>, targets: &mut Vec<Option<Arc<dyn RenderTarget>>>) {
    for target in targets.drain(..).flatten() {
        driver.remove_render_target(&target);
    }
}

fn midpoint(a: xr::Vector3f, b: xr::Vector3f) -> xr::Vector3f {
    xr::Vector3f {
        x: (a.x + b.x) * 0.5,
        y: (a.y + b.y) * 0.5,
        z: (a.z + b.z) * 0.5,
    }
}

fn log_system(instance: &xr::Instance, system: xr::SystemId) -> Result<(), SessionLost> {
    let props = check(instance.system_properties(system), "xrGetSystemProperties")?;
    info!("HMD: {}", props.system_name);
    info!("Vendor id: {}", props.vendor_id);
    info!(
        "Graphics: max swapchain {} x {}; {} composition layers",
        props.graphics_properties.max_swapchain_image_width,
        props.graphics_properties.max_swapchain_image_height,
        props.graphics_properties.max_layer_count,
    );
    let tracking = match (
        props.tracking_properties.orientation_tracking,
        props.tracking_properties.position_tracking,
    ) {
        (true, true) => "Orientation and Position",
        (true, false) => "Orientation only",
        (false, true) => "Position only",
        (false, false) => "None",
    };
    info!("Tracking: {tracking}");
    Ok(())
}

fn log_view_configurations(
    instance: &xr::Instance,
    system: xr::SystemId,
) -> Result<(), SessionLost> {
    let types = check(
        instance.enumerate_view_configurations(system),
        "xrEnumerateViewConfigurations",
    )?;
    for ty in types {
        let props = check(
            instance.view_configuration_properties(system, ty),
            "xrGetViewConfigurationProperties",
        )?;
        let label = match ty {
            xr::ViewConfigurationType::PRIMARY_MONO => "mono",
            xr::ViewConfigurationType::PRIMARY_STEREO => "stereo",
            _ => "other",
        };
        info!(
            "Supported view: {label} [type={:?}, fovMutable={}]",
            ty,
            if props.fov_mutable { "yes" } else { "no" },
        );
    }
    Ok(())
}

fn verify_graphics(
    instance: &xr::Instance,
    system: xr::SystemId,
    driver: &dyn VideoDriver,
) -> Result<(), SessionInitError> {
    graphics::verify_host_context(driver)?;

    let reqs = check(
        instance.graphics_requirements::<xr::OpenGL>(system),
        "xrGetOpenGLGraphicsRequirementsKHR",
    )?;
    info!(
        "Runtime supports OpenGL version range ({}, {})",
        reqs.min_api_version_supported, reqs.max_api_version_supported,
    );

    let (major, minor) = driver.gl_version();
    info!("Host context is OpenGL {major}.{minor}");
    let have = graphics::gl_version_of(driver);
    if have < reqs.min_api_version_supported || have > reqs.max_api_version_supported {
        error!("OpenGL initialized with incompatible version");
        return Err(SessionInitError::GlVersionUnsupported {
            have: (major, minor),
            min: reqs.min_api_version_supported,
            max: reqs.max_api_version_supported,
        });
    }
    Ok(())
}

fn choose_formats(session: &xr::Session<xr::OpenGL>) -> Result<(u32, u32), SessionInitError> {
    let formats = check(
        session.enumerate_swapchain_formats(),
        "xrEnumerateSwapchainFormats",
    )?;

    // The runtime orders formats best-first.
    let preferred_color = gl::SRGB8_ALPHA8;
    let preferred_depth = gl::DEPTH_COMPONENT32F;
    let mut color_format = formats.first().copied().unwrap_or(preferred_color);
    let mut depth_format = None;
    for &format in &formats {
        if format == preferred_color {
            color_format = format;
        }
        if format == preferred_depth {
            depth_format = Some(format);
        }
    }

    info!(
        "ColorFormat {color_format:#x}{}",
        if color_format == preferred_color {
            " (GL_SRGB8_ALPHA8)"
        } else {
            ""
        }
    );
    if color_format != preferred_color {
        warn!("Using non-preferred color format");
    }
    let Some(depth_format) = depth_format else {
        error!("Couldn't find valid depth buffer format");
        return Err(SessionInitError::NoDepthFormat);
    };
    info!("DepthFormat {depth_format:#x} (GL_DEPTH_COMPONENT32F)");

    Ok((color_format, depth_format))
}
