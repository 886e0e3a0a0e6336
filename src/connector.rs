use crate::{
    driver::VideoDriver,
    error::InitError,
    instance::{Instance, InstanceLoss},
    types::{FrameConfig, InputState, PlayArea, ViewInfo},
};
use log::error;
use openxr as xr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const INSTANCE_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[cfg(not(test))]
fn load_entry() -> xr::Entry {
    xr::Entry::linked()
}

#[cfg(test)]
fn load_entry() -> xr::Entry {
    unsafe { xr::Entry::from_get_instance_proc_addr(fakexr::get_instance_proc_addr) }.unwrap()
}

/// Top-level facade between the engine's render loop and the OpenXR
/// runtime.
///
/// After [`XrConnector::new`] succeeds, no method fails to the caller, even
/// when the runtime instance is dead and refusing to come back. The OpenXR
/// specification allows clients to reconnect after the runtime returns from
/// a crash, shutdown, or update, so the connector keeps pretending to work
/// and heals through retry timers; underlying failures surface as "no view
/// this frame".
pub struct XrConnector {
    driver: Arc<dyn VideoDriver>,
    entry: xr::Entry,
    play_space_type: xr::ReferenceSpaceType,
    instance: Option<Instance>,
    instance_retry_at: Instant,
    app_ready: bool,
    // Prevents automatic instance recreation after the runtime forces an
    // exit.
    instance_exited: bool,
}

impl XrConnector {
    pub fn new(driver: Arc<dyn VideoDriver>, area: PlayArea) -> Result<Self, InitError> {
        let play_space_type = match area {
            PlayArea::Seated => xr::ReferenceSpaceType::LOCAL,
            PlayArea::RoomScale => xr::ReferenceSpaceType::STAGE,
        };
        let entry = load_entry();
        let instance = Instance::new(&entry, driver.clone(), play_space_type)?;
        Ok(Self {
            driver,
            entry,
            play_space_type,
            instance: Some(instance),
            instance_retry_at: Instant::now(),
            app_ready: false,
            instance_exited: false,
        })
    }

    /// Register that the app is ready to start delivering frames.
    pub fn start_xr(&mut self) {
        assert!(!self.app_ready, "start_xr while already started");
        self.app_ready = true;
        self.instance_exited = false;
        if let Some(instance) = &mut self.instance {
            instance.set_app_ready(true);
        }
    }

    /// Register that the app is no longer delivering frames.
    pub fn stop_xr(&mut self) {
        assert!(self.app_ready, "stop_xr without start_xr");
        self.app_ready = false;
        if let Some(instance) = &mut self.instance {
            instance.set_app_ready(false);
        }
    }

    fn invalidate_instance(&mut self) {
        error!("Instance lost");
        self.instance = None;
        self.instance_retry_at = Instant::now() + INSTANCE_RETRY_INTERVAL;
    }

    /// Handle all pending events; returns once the queue is empty. Must be
    /// called at least once between frames, never during one. If the event
    /// queue overflows, events are lost.
    pub fn handle_events(&mut self) {
        if self.instance.is_none() {
            if self.instance_exited {
                return;
            }
            let now = Instant::now();
            if now >= self.instance_retry_at {
                self.instance_retry_at = now + INSTANCE_RETRY_INTERVAL;
                match Instance::new(&self.entry, self.driver.clone(), self.play_space_type) {
                    Ok(mut instance) => {
                        if self.app_ready {
                            instance.set_app_ready(true);
                        }
                        self.instance = Some(instance);
                    }
                    Err(err) => error!("instance creation failed: {err:?}"),
                }
            }
        }
        let Some(instance) = &mut self.instance else {
            return;
        };
        match instance.handle_events() {
            Ok(()) => {}
            Err(loss) => {
                self.invalidate_instance();
                if matches!(loss, InstanceLoss::Exited) {
                    self.instance_exited = true;
                }
            }
        }
    }

    /// Schedule a recenter before the next frame.
    pub fn recenter(&mut self) {
        if let Some(instance) = &mut self.instance {
            instance.recenter();
        }
    }

    /// Snapshot of the last synced controller input; zeroed when no
    /// session is live.
    pub fn input_state(&self) -> InputState {
        self.instance
            .as_ref()
            .map(Instance::input_state)
            .unwrap_or_default()
    }

    /// Try to begin the next frame. Blocks to achieve VSync with the HMD,
    /// so call it only once everything else has been processed.
    ///
    /// Returns true iff a frame is now in flight; the caller must then
    /// drive [`Self::next_view`] until it returns `None`. On false, skip XR
    /// rendering this iteration and throttle the loop by other means; if
    /// the system is idle (HMD off, session closed) this can stay false for
    /// an extended period while `handle_events` keeps healing.
    pub fn try_begin_frame(&mut self, config: &FrameConfig) -> bool {
        let Some(instance) = &mut self.instance else {
            return false;
        };
        instance.try_begin_frame(config)
    }

    /// Yield the views of the frame one at a time; `None` ends the frame.
    /// Don't assume every view will appear: if the runtime dies during
    /// rendering, the iterator stops short.
    pub fn next_view(&mut self) -> Option<ViewInfo> {
        let instance = self.instance.as_mut()?;
        instance.next_view()
    }

    pub fn has_xr(&self) -> bool {
        self.instance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, Fixture};
    use crate::types::{FloatingHud, ViewKind};
    use glam::{Quat, Vec3};
    use openxr::sys::StructureType;

    #[test]
    fn stereo_frame_yields_both_eyes() {
        let mut f = Fixture::ready();
        assert!(f.connector.try_begin_frame(&test_config()));

        let left = f.connector.next_view().expect("left eye");
        assert_eq!(left.kind, ViewKind::LeftEye);
        assert_eq!((left.width, left.height), (1920, 1080));
        assert_eq!(left.z_near, 1.0);
        assert_eq!(left.z_far, 20000.0);

        let right = f.connector.next_view().expect("right eye");
        assert_eq!(right.kind, ViewKind::RightEye);
        assert_eq!((right.width, right.height), (1920, 1080));

        assert!(f.connector.next_view().is_none());

        let session = fakexr::current_session();
        assert_eq!(fakexr::frames_ended(session), 1);
        let layers = fakexr::last_frame_layers(session);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].ty, StructureType::COMPOSITION_LAYER_PROJECTION);
        assert_eq!(layers[0].view_count, 2);
    }

    #[test]
    fn floating_hud_adds_quad_layer() {
        let mut f = Fixture::ready();
        let mut config = test_config();
        config.floating_hud = FloatingHud {
            enable: true,
            size: (3.2, 1.8),
            position: Vec3::new(0.0, 0.0, 1.25),
            orientation: Quat::IDENTITY,
        };
        assert!(f.connector.try_begin_frame(&config));

        assert_eq!(f.connector.next_view().unwrap().kind, ViewKind::LeftEye);
        assert_eq!(f.connector.next_view().unwrap().kind, ViewKind::RightEye);
        let hud = f.connector.next_view().expect("hud view");
        assert_eq!(hud.kind, ViewKind::Hud);
        assert_eq!((hud.width, hud.height), (1920, 1080));
        assert!(f.connector.next_view().is_none());

        let session = fakexr::current_session();
        let layers = fakexr::last_frame_layers(session);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].ty, StructureType::COMPOSITION_LAYER_PROJECTION);
        assert_eq!(layers[1].ty, StructureType::COMPOSITION_LAYER_QUAD);
        // Engine coordinates are left-handed; the submitted quad pose must
        // have its Z negated back into runtime coordinates.
        assert_eq!(layers[1].pose.position.z, -1.25);
        assert_eq!(layers[1].size.width, 3.2);
        assert_eq!(layers[1].size.height, 1.8);
    }

    #[test]
    fn begin_frame_is_noop_before_ready() {
        let mut f = Fixture::new();
        f.connector.start_xr();
        // READY is still sitting in the event queue.
        assert!(!f.connector.try_begin_frame(&test_config()));
        assert_eq!(fakexr::frames_ended(fakexr::current_session()), 0);
    }

    #[test]
    fn begin_frame_is_noop_when_not_ready() {
        let mut f = Fixture::ready();
        f.run_frame();

        let session = fakexr::current_session();
        fakexr::set_session_state(session, openxr::SessionState::STOPPING);
        f.connector.handle_events();
        assert!(!fakexr::session_running(session));

        fakexr::set_session_state(session, openxr::SessionState::SYNCHRONIZED);
        f.connector.handle_events();
        assert!(!f.connector.try_begin_frame(&test_config()));

        fakexr::set_session_state(session, openxr::SessionState::READY);
        f.connector.handle_events();
        assert!(f.connector.try_begin_frame(&test_config()));
        while f.connector.next_view().is_some() {}
    }

    #[test]
    fn locate_views_failure_destroys_session() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        fakexr::fail_next_locate_views(fakexr::current_instance());

        assert!(!f.connector.try_begin_frame(&test_config()));
        assert!(f.connector.has_xr());
        assert!(!fakexr::session_alive(session));
        // No session until the retry timer fires.
        assert!(!f.connector.try_begin_frame(&test_config()));
    }

    #[test]
    fn view_iterator_is_total() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();

        for frame in 1..=3u32 {
            assert!(f.connector.try_begin_frame(&test_config()));
            let mut views = 0;
            while f.connector.next_view().is_some() {
                views += 1;
            }
            assert_eq!(views, 2);
            assert_eq!(fakexr::frames_ended(session), frame);
        }
    }

    #[test]
    fn unchanged_hud_size_keeps_swapchains() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        let mut config = test_config();
        config.floating_hud.enable = true;
        config.floating_hud.size = (2.0, 1.0);

        f.run_frame_with(&config);
        let after_first = fakexr::swapchains_created(session);

        f.run_frame_with(&config);
        assert_eq!(fakexr::swapchains_created(session), after_first);

        config.hud_size = (800, 600);
        f.run_frame_with(&config);
        // Rebuilding the HUD chain makes one color and one depth swapchain.
        assert_eq!(fakexr::swapchains_created(session), after_first + 2);
        f.run_frame_with(&config);
        assert_eq!(fakexr::swapchains_created(session), after_first + 2);
    }

    #[test]
    fn skipped_frames_are_still_begun_and_ended() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        // Set before the session begins, so the first xrWaitFrame sees it.
        fakexr::should_render_next_frame(fakexr::current_instance(), false);

        assert!(f.connector.try_begin_frame(&test_config()));
        assert!(f.connector.next_view().is_none());
        assert_eq!(fakexr::frames_ended(session), 1);
        assert!(fakexr::last_frame_layers(session).is_empty());

        // The wait for the next frame was issued while rendering was still
        // off, so one more frame is skipped before views come back.
        fakexr::should_render_next_frame(fakexr::current_instance(), true);
        assert!(f.connector.try_begin_frame(&test_config()));
        assert!(f.connector.next_view().is_none());
        assert_eq!(fakexr::frames_ended(session), 2);

        f.run_frame();
        assert_eq!(fakexr::last_frame_layers(session).len(), 1);
    }

    #[test]
    fn recenter_keeps_yaw_drops_pitch() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();

        let yaw = 0.9_f32;
        let pitch = 0.5_f32;
        let head = Quat::from_euler(glam::EulerRot::YXZ, yaw, pitch, 0.0);
        fakexr::set_view_pose(
            session,
            openxr::sys::Posef {
                orientation: openxr::sys::Quaternionf {
                    x: head.x,
                    y: head.y,
                    z: head.z,
                    w: head.w,
                },
                position: openxr::sys::Vector3f {
                    x: 0.5,
                    y: 1.7,
                    z: -0.25,
                },
            },
        );

        f.connector.recenter();
        f.run_frame();

        let offset = fakexr::last_reference_space_pose(
            session,
            openxr::sys::ReferenceSpaceType::STAGE,
        )
        .expect("play space was recreated");
        assert_eq!(offset.orientation.x, 0.0);
        assert_eq!(offset.orientation.z, 0.0);
        let expected = Quat::from_rotation_y(yaw);
        assert!((offset.orientation.y - expected.y).abs() < 1e-4);
        assert!((offset.orientation.w - expected.w).abs() < 1e-4);
        assert_eq!(offset.position.x, 0.5);
        assert_eq!(offset.position.y, 1.7);
        assert_eq!(offset.position.z, -0.25);
    }

    #[test]
    fn stop_xr_destroys_running_session() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        f.run_frame();

        f.connector.stop_xr();
        assert!(!fakexr::session_alive(session));
        assert!(f.connector.has_xr());
        assert_eq!(f.connector.input_state(), Default::default());

        // The replacement session is scheduled for an immediate retry.
        f.connector.start_xr();
        f.connector.handle_events();
        let replacement = fakexr::current_session();
        assert_ne!(session, replacement);
        assert!(f.connector.try_begin_frame(&test_config()));
        while f.connector.next_view().is_some() {}
    }

    #[test]
    fn exiting_destroys_instance_without_retry() {
        let mut f = Fixture::ready();
        f.run_frame();

        fakexr::set_session_state(fakexr::current_session(), openxr::SessionState::EXITING);
        f.connector.handle_events();
        assert!(!f.connector.has_xr());

        // Deliberate exit: no automatic recreation.
        f.connector.handle_events();
        assert!(!f.connector.has_xr());
    }

    #[test]
    fn render_targets_are_surrendered_on_session_teardown() {
        let mut f = Fixture::ready();
        // Every swapchain image was wrapped into an engine texture up
        // front: (2 eye chains + 1 hud chain) x (color + depth) x 3 images.
        assert_eq!(f.driver.textures_created(), 18);

        f.run_frame();
        assert!(f.driver.targets_alive() > 0);

        f.connector.stop_xr();
        assert_eq!(f.driver.targets_alive(), 0);
    }
}
