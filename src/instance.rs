use crate::{
    driver::VideoDriver,
    error::InitError,
    session::Session,
    types::{FrameConfig, InputState, ViewInfo},
};
use log::{error, info};
use openxr as xr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SESSION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Why the instance has to go away.
pub(crate) enum InstanceLoss {
    /// Runtime died or signaled loss; recreate on the retry cadence.
    Lost,
    /// The runtime asked us to exit; don't recreate until the next
    /// start_xr.
    Exited,
}

/// Owner of the `XrInstance`. Polls the event queue, routes session state
/// changes, and revives the session after transient failures.
pub(crate) struct Instance {
    driver: Arc<dyn VideoDriver>,
    play_space_type: xr::ReferenceSpaceType,
    instance: xr::Instance,
    session: Option<Session>,
    session_retry_at: Instant,
    app_ready: bool,
}

impl Instance {
    pub fn new(
        entry: &xr::Entry,
        driver: Arc<dyn VideoDriver>,
        play_space_type: xr::ReferenceSpaceType,
    ) -> Result<Self, InitError> {
        info!("Initializing OpenXR");
        let supported = entry.enumerate_extensions().map_err(|err| {
            error!("xrEnumerateInstanceExtensionProperties error: {err:?}");
            InitError::EnumeratingExtensionsFailed(err)
        })?;
        info!(
            "Runtime extension support: opengl_enable={}, composition_layer_depth={}",
            supported.khr_opengl_enable, supported.khr_composition_layer_depth,
        );

        if !supported.khr_composition_layer_depth {
            error!("OpenXR runtime does not support depth composition layer");
            return Err(InitError::MissingExtension("XR_KHR_composition_layer_depth"));
        }
        if !supported.khr_opengl_enable {
            error!("OpenXR runtime does not support OpenGL");
            return Err(InitError::MissingExtension("XR_KHR_opengl_enable"));
        }
        let mut extensions = xr::ExtensionSet::default();
        extensions.khr_composition_layer_depth = true;
        extensions.khr_opengl_enable = true;

        let instance = entry
            .create_instance(
                &xr::ApplicationInfo {
                    application_name: "Minetest",
                    application_version: 1,
                    ..Default::default()
                },
                &extensions,
                &[],
            )
            .map_err(|err| {
                if matches!(
                    err,
                    xr::sys::Result::ERROR_RUNTIME_FAILURE
                        | xr::sys::Result::ERROR_RUNTIME_UNAVAILABLE
                ) {
                    error!(
                        "Failed to connect to OpenXR runtime!\n\
                         Ensure that your XR provider (e.g. SteamVR)\n\
                         is running and has OpenXR enabled."
                    );
                } else {
                    error!("xrCreateInstance error: {err:?}");
                }
                InitError::InstanceCreationFailed(err)
            })?;

        let props = instance.properties().map_err(|err| {
            error!("xrGetInstanceProperties error: {err:?}");
            InitError::InstanceCreationFailed(err)
        })?;
        info!("OpenXR Runtime: {}", props.runtime_name);
        info!("OpenXR Version: {}", props.runtime_version);

        let session = Session::new(&instance, driver.clone(), play_space_type)
            .map_err(|err| {
                error!("session creation failed: {err:?}");
                InitError::SessionCreationFailed(err)
            })?;

        Ok(Self {
            driver,
            play_space_type,
            instance,
            session: Some(session),
            session_retry_at: Instant::now() + SESSION_RETRY_INTERVAL,
            app_ready: false,
        })
    }

    fn invalidate_session(&mut self) {
        error!("Session lost");
        self.session = None;
        self.session_retry_at = Instant::now() + SESSION_RETRY_INTERVAL;
    }

    fn try_create_session(&mut self) {
        assert!(self.session.is_none());
        match Session::new(&self.instance, self.driver.clone(), self.play_space_type) {
            Ok(session) => self.session = Some(session),
            Err(err) => error!("session creation failed: {err:?}"),
        }
    }

    pub fn set_app_ready(&mut self, ready: bool) {
        self.app_ready = ready;
        if let Some(session) = &mut self.session {
            if !session.set_app_ready(ready) {
                // Fast termination: the session can't stop in place, so
                // destroy it and retry immediately.
                self.invalidate_session();
                self.session_retry_at = Instant::now();
            }
        }
    }

    /// Drain the event queue, reviving the session first when it's due.
    /// An error here means the instance itself must be destroyed.
    pub fn handle_events(&mut self) -> Result<(), InstanceLoss> {
        if self.session.is_none() {
            let now = Instant::now();
            if now >= self.session_retry_at {
                self.try_create_session();
                self.session_retry_at = now + SESSION_RETRY_INTERVAL;
                if self.app_ready {
                    if let Some(session) = &mut self.session {
                        // Becoming ready never tears a fresh session down.
                        let _ = session.set_app_ready(true);
                    }
                }
            }
        }

        let mut buffer = xr::EventDataBuffer::new();
        loop {
            let event = match self.instance.poll_event(&mut buffer) {
                Ok(event) => event,
                Err(err) => {
                    error!("xrPollEvent error: {err:?}");
                    return Err(InstanceLoss::Lost);
                }
            };
            let Some(event) = event else { return Ok(()) };
            match event {
                xr::Event::EventsLost(lost) => {
                    error!(
                        "OpenXR event queue overflowed, lost {} events",
                        lost.lost_event_count()
                    );
                }
                xr::Event::InstanceLossPending(_) => {
                    error!("Disconnected (lost instance)");
                    return Err(InstanceLoss::Lost);
                }
                xr::Event::SessionStateChanged(changed) => {
                    if let Some(session) = &mut self.session {
                        if session
                            .handle_state_change(changed.session(), changed.state())
                            .is_err()
                        {
                            self.invalidate_session();
                        }
                    }
                    if changed.state() == xr::SessionState::EXITING {
                        // Runtimes disagree on whether xrEndSession may run
                        // here, so the instance goes down with the session.
                        return Err(InstanceLoss::Exited);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn recenter(&mut self) {
        if let Some(session) = &mut self.session {
            session.recenter();
        }
    }

    pub fn input_state(&self) -> InputState {
        self.session
            .as_ref()
            .map(Session::input_state)
            .unwrap_or_default()
    }

    pub fn try_begin_frame(&mut self, config: &FrameConfig) -> bool {
        let Some(session) = &mut self.session else {
            return false;
        };
        match session.try_begin_frame(config) {
            Ok(did_begin) => did_begin,
            Err(_) => {
                self.invalidate_session();
                false
            }
        }
    }

    pub fn next_view(&mut self) -> Option<ViewInfo> {
        let session = self.session.as_mut()?;
        match session.next_view() {
            Ok(view) => view,
            Err(_) => {
                self.invalidate_session();
                None
            }
        }
    }
}
