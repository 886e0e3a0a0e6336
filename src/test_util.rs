use crate::{
    connector::XrConnector,
    driver::{RenderTarget, Texture, TextureFormat, VideoDriver, WindowSystem},
    graphics,
    types::{FrameConfig, PlayArea},
};
use std::cell::Cell;
use std::sync::Arc;

pub(crate) struct FakeTexture {
    size: (u32, u32),
}

impl Texture for FakeTexture {
    fn size(&self) -> (u32, u32) {
        self.size
    }
}

pub(crate) struct FakeTarget;

impl RenderTarget for FakeTarget {
    fn set_textures(&self, _color: &Arc<dyn Texture>, _depth: &Arc<dyn Texture>) {}
}

#[derive(Default)]
pub(crate) struct FakeDriver {
    targets: Cell<usize>,
    textures: Cell<usize>,
}

impl FakeDriver {
    pub fn targets_alive(&self) -> usize {
        self.targets.get()
    }

    pub fn textures_created(&self) -> usize {
        self.textures.get()
    }
}

impl VideoDriver for FakeDriver {
    fn window_system(&self) -> WindowSystem {
        graphics::EXPECTED_WINDOW_SYSTEM
    }

    fn gl_version(&self) -> (u8, u8) {
        (4, 6)
    }

    fn is_gles(&self) -> bool {
        false
    }

    fn screen_size(&self) -> (u32, u32) {
        (1920, 1080)
    }

    fn add_render_target(&self) -> Arc<dyn RenderTarget> {
        self.targets.set(self.targets.get() + 1);
        Arc::new(FakeTarget)
    }

    fn remove_render_target(&self, _target: &Arc<dyn RenderTarget>) {
        self.targets.set(self.targets.get() - 1);
    }

    fn use_device_dependent_texture(
        &self,
        _name: &str,
        _image: u32,
        _format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Arc<dyn Texture> {
        self.textures.set(self.textures.get() + 1);
        Arc::new(FakeTexture {
            size: (width, height),
        })
    }
}

pub(crate) fn test_config() -> FrameConfig {
    FrameConfig {
        hud_size: (1920, 1080),
        floating_hud: Default::default(),
    }
}

pub(crate) struct Fixture {
    pub connector: XrConnector,
    pub driver: Arc<FakeDriver>,
}

impl Fixture {
    pub fn new() -> Self {
        crate::init_logging();
        let driver = Arc::new(FakeDriver::default());
        let connector =
            XrConnector::new(driver.clone() as Arc<dyn VideoDriver>, PlayArea::RoomScale)
                .expect("connector creation");
        Self { connector, driver }
    }

    /// A connector that has started XR and pumped the queue up to READY.
    pub fn ready() -> Self {
        let mut fixture = Self::new();
        fixture.connector.start_xr();
        fixture.connector.handle_events();
        fixture
    }

    pub fn run_frame(&mut self) {
        self.run_frame_with(&test_config());
    }

    pub fn run_frame_with(&mut self, config: &FrameConfig) {
        assert!(self.connector.try_begin_frame(config));
        while self.connector.next_view().is_some() {}
    }
}
