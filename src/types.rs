use crate::driver::RenderTarget;
use crate::math::Pose;
use glam::{Quat, Vec3};
use std::sync::Arc;

/// Reference frame anchored to the player's physical area. Chosen once at
/// connector creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlayArea {
    /// `LOCAL` reference space, origin near the head at startup.
    Seated,
    /// `STAGE` reference space, origin on the floor of the tracked area.
    RoomScale,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Hand {
    Left = 0,
    Right = 1,
}

/// Button state sampled at the last action sync.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Button {
    pub pressed: bool,
    /// Set when the controller has capacitive sensors and the player's
    /// finger rests on or near the button.
    pub touched: bool,
    /// Analog travel in [0, 1]. Buttons without a continuous trigger jump
    /// straight from 0 to 1.
    pub value: f32,
}

/// A tracked pose; `pose` is only meaningful while `valid` is set.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct InputPose {
    pub valid: bool,
    pub pose: Pose,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct HandState {
    /// Pointing position and direction.
    pub aim: InputPose,
    /// Where objects are gripped.
    pub grip: InputPose,
    pub attack: Button,
    pub interact: Button,
    pub menu: Button,
}

/// Per-frame controller snapshot, refreshed on every action sync and
/// exposed by copy.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct InputState {
    pub hands: [HandState; 2],
}

impl InputState {
    pub fn hand(&self, hand: Hand) -> &HandState {
        &self.hands[hand as usize]
    }
}

/// Floating HUD placement for one frame, in engine coordinates.
#[derive(Copy, Clone, Debug)]
pub struct FloatingHud {
    pub enable: bool,
    /// World size of the quad in meters.
    pub size: (f32, f32),
    /// Center of the quad in the play space.
    pub position: Vec3,
    pub orientation: Quat,
}

impl Default for FloatingHud {
    fn default() -> Self {
        Self {
            enable: false,
            size: (0.0, 0.0),
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
        }
    }
}

/// Engine-supplied configuration for one frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameConfig {
    /// Pixel dimensions of the HUD swapchain; a change forces a rebuild
    /// before the frame begins.
    pub hud_size: (u32, u32),
    pub floating_hud: FloatingHud,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewKind {
    Invalid,
    LeftEye,
    RightEye,
    Hud,
    Generic,
}

/// One renderable view of the current frame.
///
/// Eye poses are relative to the play space origin, already converted to
/// engine coordinates. Positions are in meters; scaling into engine units
/// is the caller's concern.
#[derive(Clone)]
pub struct ViewInfo {
    pub kind: ViewKind,
    pub target: Arc<dyn RenderTarget>,
    pub width: u32,
    pub height: u32,
    pub position: Vec3,
    pub orientation: Quat,
    /// Midpoint between the two eyes, for IPD adjustment.
    pub position_base: Vec3,
    /// FoV angles in radians. For a symmetric FoV, left/down are negative;
    /// total angles are `angle_right - angle_left` and
    /// `angle_up - angle_down`.
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
    pub z_near: f32,
    pub z_far: f32,
}
