//! An in-process fake OpenXR runtime exposing the loader ABI through
//! [`get_instance_proc_addr`]. It models just enough of a compliant
//! runtime to drive the full session/frame/input protocol from tests:
//! session lifecycle events, frame call ordering, swapchain image cycling,
//! reference and action spaces over a tiny world model (one head pose, one
//! pose per hand), and synced action state.
//!
//! Tests steer it through the `set_*` functions and observe it through the
//! counters and capture getters. The "current" instance/session trackers
//! are thread local, so parallel tests don't see each other's handles.

use crossbeam_utils::atomic::AtomicCell;
use glam::{Affine3A, Quat, Vec3};
use openxr_sys as xr;
use paste::paste;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::ffi::{c_char, CStr, CString};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    mpsc, Arc, LazyLock, Mutex, MutexGuard, OnceLock, Weak,
};

// GL formats advertised by EnumerateSwapchainFormats, best first.
const GL_SRGB8_ALPHA8: i64 = 0x8C43;
const GL_RGBA8: i64 = 0x8058;
const GL_DEPTH_COMPONENT32F: i64 = 0x8CAC;
const GL_DEPTH_COMPONENT24: i64 = 0x81A6;

const VIEW_WIDTH: u32 = 1920;
const VIEW_HEIGHT: u32 = 1080;
const SWAPCHAIN_LENGTH: u32 = 3;
const IPD: f32 = 0.063;

thread_local! {
    static CURRENT_INSTANCE: Cell<xr::Instance> = const { Cell::new(xr::Instance::NULL) };
    static CURRENT_SESSION: Cell<xr::Session> = const { Cell::new(xr::Session::NULL) };
}

/// The most recently created instance on this thread.
pub fn current_instance() -> xr::Instance {
    CURRENT_INSTANCE.get()
}

/// The most recently created session on this thread.
pub fn current_session() -> xr::Session {
    CURRENT_SESSION.get()
}

#[derive(Copy, Clone, PartialEq)]
pub enum ActionState {
    Bool(bool),
    Float(f32),
    Pose,
}

#[derive(Copy, Clone, PartialEq)]
pub enum UserPath {
    /// /user/hand/left
    LeftHand,
    /// /user/hand/right
    RightHand,
}

impl UserPath {
    fn from_path(s: &str) -> Option<Self> {
        match s {
            "/user/hand/left" => Some(Self::LeftHand),
            "/user/hand/right" => Some(Self::RightHand),
            _ => None,
        }
    }
}

/// Stage the next synced value of a named action. Takes effect at the next
/// xrSyncActions, like a real device.
pub fn set_action_state(session: xr::Session, name: &str, state: ActionState, hand: UserPath) {
    let session = session.to_handle().unwrap();
    let action =
        find_action(&session, name).unwrap_or_else(|| panic!("no attached action named {name:?}"));
    let mut pending = action.pending.take();
    match hand {
        UserPath::LeftHand => pending.left = Some(state),
        UserPath::RightHand => pending.right = Some(state),
    }
    action.pending.store(pending);
    action.active.store(true, Ordering::Relaxed);
}

pub fn set_grip(session: xr::Session, hand: UserPath, pose: xr::Posef) {
    let session = session.to_handle().unwrap();
    let hand = hand_data(&session, hand);
    hand.grip_pose.store(pose);
    hand.tracked.store(true, Ordering::Relaxed);
}

pub fn set_aim(session: xr::Session, hand: UserPath, pose: xr::Posef) {
    let session = session.to_handle().unwrap();
    let hand = hand_data(&session, hand);
    hand.aim_pose.store(pose);
    hand.tracked.store(true, Ordering::Relaxed);
}

/// Move the HMD in the world frame.
pub fn set_view_pose(session: xr::Session, pose: xr::Posef) {
    session.to_handle().unwrap().view_pose.store(pose);
}

/// Queue a session state change event.
pub fn set_session_state(session: xr::Session, state: xr::SessionState) {
    let handle = session.to_handle().unwrap();
    send_event(
        &handle.event_sender,
        xr::EventDataSessionStateChanged {
            ty: xr::EventDataSessionStateChanged::TYPE,
            next: std::ptr::null(),
            session,
            state,
            time: xr::Time::from_nanos(0),
        },
    );
}

pub fn set_focused(session: xr::Session, focused: bool) {
    session
        .to_handle()
        .unwrap()
        .focused
        .store(focused, Ordering::Relaxed);
}

pub fn should_render_next_frame(instance: xr::Instance, should_render: bool) {
    instance
        .to_handle()
        .unwrap()
        .should_render
        .store(should_render, Ordering::Relaxed);
}

/// Make the next xrLocateViews call fail with ERROR_RUNTIME_FAILURE.
pub fn fail_next_locate_views(instance: xr::Instance) {
    instance
        .to_handle()
        .unwrap()
        .fail_locate_views
        .store(true, Ordering::Relaxed);
}

pub fn session_alive(session: xr::Session) -> bool {
    session.to_handle().is_some()
}

pub fn session_running(session: xr::Session) -> bool {
    session
        .to_handle()
        .map(|s| s.running.load(Ordering::Relaxed))
        .unwrap_or(false)
}

pub fn frames_ended(session: xr::Session) -> u32 {
    session
        .to_handle()
        .map(|s| s.frames_ended.load(Ordering::Relaxed))
        .unwrap_or(0)
}

pub fn swapchains_created(session: xr::Session) -> u32 {
    session
        .to_handle()
        .map(|s| s.swapchains_created.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Summary of one composition layer from the last xrEndFrame.
#[derive(Copy, Clone)]
pub struct SubmittedLayer {
    pub ty: xr::StructureType,
    /// Projection layers: number of views.
    pub view_count: u32,
    /// Quad layers: submitted pose and size.
    pub pose: xr::Posef,
    pub size: xr::Extent2Df,
}

pub fn last_frame_layers(session: xr::Session) -> Vec<SubmittedLayer> {
    session
        .to_handle()
        .map(|s| s.last_layers.lock().unwrap().clone())
        .unwrap_or_default()
}

/// The pose most recently passed to xrCreateReferenceSpace for this type.
pub fn last_reference_space_pose(
    session: xr::Session,
    ty: xr::ReferenceSpaceType,
) -> Option<xr::Posef> {
    let session = session.to_handle()?;
    let poses = session.last_ref_space_pose.lock().unwrap();
    poses.get(&ty.into_raw()).copied()
}

/// Binding paths suggested for a named action under a profile.
pub fn get_suggested_bindings(
    instance: xr::Instance,
    action_name: &str,
    profile: &str,
) -> Vec<String> {
    let instance = instance.to_handle().unwrap();
    let Some(profile_key) = instance.string_to_path.lock().unwrap().get(profile).copied() else {
        return Vec::new();
    };
    let profile_path = xr::Path::from_raw(profile_key.data().as_ffi());

    for set in instance.action_sets.lock().unwrap().iter().copied() {
        let Some(set) = set.to_handle() else { continue };
        for action in set.all_actions() {
            if action.name.to_str() != Ok(action_name) {
                continue;
            }
            let suggested = action.suggested.lock().unwrap();
            return suggested
                .get(&profile_path)
                .map(|paths| {
                    paths
                        .iter()
                        .filter_map(|p| instance.get_path_value(*p).ok().flatten())
                        .collect()
                })
                .unwrap_or_default();
        }
    }
    Vec::new()
}

fn find_action(session: &Session, name: &str) -> Option<Arc<Action>> {
    let sets = session.attached_sets.get()?;
    for set in sets.iter() {
        let set = set.to_handle()?;
        for action in set.all_actions() {
            if action.name.to_str() == Ok(name) {
                return Some(action);
            }
        }
    }
    None
}

fn hand_data(session: &Session, hand: UserPath) -> &HandData {
    match hand {
        UserPath::LeftHand => &session.left_hand,
        UserPath::RightHand => &session.right_hand,
    }
}

// ---------------------------------------------------------------------------
// Handle registry

trait Handle: 'static {
    type XrType: XrType;
    fn instances() -> MutexGuard<'static, SlotMap<DefaultKey, Arc<Self>>>;
    fn to_xr(self: Arc<Self>) -> Self::XrType;
}

trait XrType {
    type Handle: Handle;
    const TO_RAW: fn(Self) -> u64;
    fn to_handle(self) -> Option<Arc<Self::Handle>>;
}

macro_rules! get_handle {
    ($handle:expr) => {{
        match <_ as XrType>::to_handle($handle) {
            Some(handle) => handle,
            None => {
                println!("unknown handle for {} ({:?})", stringify!($handle), $handle);
                return xr::Result::ERROR_HANDLE_INVALID;
            }
        }
    }};
}

macro_rules! impl_handle {
    ($ty:ty, $xr_type:ty) => {
        impl XrType for $xr_type {
            type Handle = $ty;
            const TO_RAW: fn(Self) -> u64 = <$xr_type>::into_raw;
            fn to_handle(self) -> Option<Arc<Self::Handle>> {
                Self::Handle::instances()
                    .get(DefaultKey::from(KeyData::from_ffi(self.into_raw())))
                    .map(|i| Arc::clone(i))
            }
        }
        impl Handle for $ty {
            type XrType = $xr_type;
            fn instances() -> MutexGuard<'static, SlotMap<DefaultKey, Arc<Self>>> {
                static I: LazyLock<Mutex<SlotMap<DefaultKey, Arc<$ty>>>> =
                    LazyLock::new(|| Mutex::default());
                I.lock().unwrap()
            }
            fn to_xr(self: Arc<Self>) -> $xr_type {
                let key = Self::instances().insert(self);
                <$xr_type>::from_raw(key.data().as_ffi())
            }
        }
    };
}

struct EventDataBuffer(Vec<u8>);

struct Instance {
    event_receiver: Mutex<mpsc::Receiver<EventDataBuffer>>,
    event_sender: mpsc::Sender<EventDataBuffer>,
    paths: Mutex<SlotMap<DefaultKey, String>>,
    string_to_path: Mutex<HashMap<String, DefaultKey>>,
    should_render: AtomicBool,
    fail_locate_views: AtomicBool,
    action_sets: Mutex<HashSet<xr::ActionSet>>,
}

impl Instance {
    fn get_path_value(&self, path: xr::Path) -> Result<Option<String>, ()> {
        if path == xr::Path::NULL {
            Ok(None)
        } else {
            let key = DefaultKey::from(KeyData::from_ffi(path.into_raw()));
            self.paths
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .map(Some)
                .ok_or(())
        }
    }

    fn get_user_path(&self, path: xr::Path) -> Result<Option<UserPath>, ()> {
        Ok(self
            .get_path_value(path)?
            .and_then(|v| UserPath::from_path(&v)))
    }
}

struct HandData {
    tracked: AtomicBool,
    grip_pose: AtomicCell<xr::Posef>,
    aim_pose: AtomicCell<xr::Posef>,
}

impl Default for HandData {
    fn default() -> Self {
        Self {
            tracked: false.into(),
            grip_pose: xr::Posef::IDENTITY.into(),
            aim_pose: xr::Posef::IDENTITY.into(),
        }
    }
}

struct Session {
    instance: Weak<Instance>,
    event_sender: mpsc::Sender<EventDataBuffer>,
    running: AtomicBool,
    focused: AtomicBool,
    frame_waited: AtomicBool,
    frame_active: AtomicBool,
    frame_counter: AtomicU64,
    frames_ended: AtomicU32,
    swapchains_created: AtomicU32,
    attached_sets: OnceLock<Box<[xr::ActionSet]>>,
    left_hand: HandData,
    right_hand: HandData,
    view_pose: AtomicCell<xr::Posef>,
    spaces: Mutex<HashSet<DefaultKey>>,
    last_ref_space_pose: Mutex<HashMap<i32, xr::Posef>>,
    last_layers: Mutex<Vec<SubmittedLayer>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        let spaces = self.spaces.lock().unwrap();
        for space in spaces.iter() {
            Space::instances().remove(*space);
        }
    }
}

static LOCATION_FLAGS_TRACKED: LazyLock<xr::SpaceLocationFlags> = LazyLock::new(|| {
    xr::SpaceLocationFlags::POSITION_VALID
        | xr::SpaceLocationFlags::POSITION_TRACKED
        | xr::SpaceLocationFlags::ORIENTATION_VALID
        | xr::SpaceLocationFlags::ORIENTATION_TRACKED
});

enum SpaceRole {
    Reference(xr::ReferenceSpaceType),
    Action {
        action: Weak<Action>,
        hand: Option<UserPath>,
    },
}

struct Space {
    session: Weak<Session>,
    role: SpaceRole,
    offset: xr::Posef,
}

impl Space {
    /// Pose in the world frame (which coincides with LOCAL and STAGE), or
    /// None when untracked.
    fn world_pose(&self) -> Result<Option<xr::Posef>, xr::Result> {
        let session = self
            .session
            .upgrade()
            .ok_or(xr::Result::ERROR_SESSION_LOST)?;
        let base = match &self.role {
            SpaceRole::Reference(ty) => match *ty {
                xr::ReferenceSpaceType::VIEW => session.view_pose.load(),
                xr::ReferenceSpaceType::LOCAL | xr::ReferenceSpaceType::STAGE => {
                    xr::Posef::IDENTITY
                }
                other => panic!("unimplemented reference space type: {other:?}"),
            },
            SpaceRole::Action { action, hand } => {
                let hand = hand.unwrap_or(UserPath::LeftHand);
                let data = hand_data(&session, hand);
                if !data.tracked.load(Ordering::Relaxed) {
                    return Ok(None);
                }
                let action = action.upgrade().unwrap();
                match action.pose_kind(&session) {
                    Some(PoseKind::Grip) => data.grip_pose.load(),
                    Some(PoseKind::Aim) => data.aim_pose.load(),
                    None => return Ok(None),
                }
            }
        };
        Ok(Some(mat_to_pose(
            pose_to_mat(base) * pose_to_mat(self.offset),
        )))
    }
}

enum PoseKind {
    Grip,
    Aim,
}

struct ActionSet {
    instance: Weak<Instance>,
    #[allow(dead_code)]
    name: CString,
    pending_actions: Mutex<Vec<Arc<Action>>>,
    actions: OnceLock<Vec<Arc<Action>>>,
    active: AtomicBool,
}

impl ActionSet {
    fn make_immutable(&self) {
        let actions = std::mem::take(&mut *self.pending_actions.lock().unwrap());
        self.actions
            .set(actions)
            .unwrap_or_else(|_| panic!("action set already immutable"));
    }

    fn all_actions(&self) -> Vec<Arc<Action>> {
        match self.actions.get() {
            Some(actions) => actions.clone(),
            None => self.pending_actions.lock().unwrap().clone(),
        }
    }
}

struct Action {
    name: CString,
    active: AtomicBool,
    state: LeftRight<AtomicCell<ActionState>>,
    pending: AtomicCell<LeftRight<Option<ActionState>>>,
    suggested: Mutex<HashMap<xr::Path, Vec<xr::Path>>>,
}

impl Action {
    fn hand_state(&self, instance: &Instance, path: xr::Path) -> ActionState {
        match instance.get_user_path(path).unwrap() {
            None | Some(UserPath::LeftHand) => self.state.left.load(),
            Some(UserPath::RightHand) => self.state.right.load(),
        }
    }

    /// Whether this pose action is bound to grip or aim, per its suggested
    /// bindings.
    fn pose_kind(&self, session: &Session) -> Option<PoseKind> {
        let instance = session.instance.upgrade()?;
        let suggested = self.suggested.lock().unwrap();
        for paths in suggested.values() {
            for path in paths {
                let Ok(Some(value)) = instance.get_path_value(*path) else {
                    continue;
                };
                if value.ends_with("/grip/pose") {
                    return Some(PoseKind::Grip);
                }
                if value.ends_with("/aim/pose") {
                    return Some(PoseKind::Aim);
                }
            }
        }
        None
    }
}

#[derive(Copy, Clone, Default)]
struct LeftRight<T> {
    left: T,
    right: T,
}

struct Swapchain {
    images: Vec<u32>,
    acquired: AtomicCell<Option<u32>>,
    next_index: AtomicU32,
}

impl_handle!(Instance, xr::Instance);
impl_handle!(Session, xr::Session);
impl_handle!(ActionSet, xr::ActionSet);
impl_handle!(Action, xr::Action);
impl_handle!(Space, xr::Space);
impl_handle!(Swapchain, xr::Swapchain);

fn destroy_handle<T: XrType>(handle: T) -> xr::Result {
    T::Handle::instances().remove(DefaultKey::from(KeyData::from_ffi(T::TO_RAW(handle))));
    xr::Result::SUCCESS
}

fn send_event<T: Copy>(tx: &mpsc::Sender<EventDataBuffer>, event: T) {
    const {
        assert!(std::mem::size_of::<T>() <= std::mem::size_of::<xr::EventDataBuffer>());
    }

    let bytes = unsafe {
        std::slice::from_raw_parts(&event as *const T as *const u8, std::mem::size_of::<T>())
    }
    .to_vec();
    tx.send(EventDataBuffer(bytes)).unwrap();
}

fn pose_to_mat(
    xr::Posef {
        position: p,
        orientation: r,
    }: xr::Posef,
) -> Affine3A {
    Affine3A::from_rotation_translation(
        Quat::from_xyzw(r.x, r.y, r.z, r.w),
        Vec3::new(p.x, p.y, p.z),
    )
}

fn mat_to_pose(mat: Affine3A) -> xr::Posef {
    let (_, rot, pos) = mat.to_scale_rotation_translation();
    xr::Posef {
        orientation: xr::Quaternionf {
            x: rot.x,
            y: rot.y,
            z: rot.z,
            w: rot.w,
        },
        position: xr::Vector3f {
            x: pos.x,
            y: pos.y,
            z: pos.z,
        },
    }
}

// ---------------------------------------------------------------------------
// Entry points

macro_rules! fn_unimplemented_impl {
    ($($param:ident),+) => {
        fn_unimplemented_impl!($($param),+  -> []);
    };
    ($param:ident $(,$rest:ident)* -> [$($params:ident),*]) => {
        paste! {
            #[allow(dead_code)]
            trait [<FnUnimplemented $param>]<$($params,)* $param> {
                extern "system" fn unimplemented($(_: $params,)* _: $param) -> xr::Result {
                    unimplemented!()
                }
            }

            impl<$($params,)* $param> [<FnUnimplemented $param>]<$($params,)* $param> for unsafe extern "system" fn($($params,)* $param) -> xr::Result {}
        }

        fn_unimplemented_impl!($($rest),* -> [$($params,)* $param]);
    };
    (-> [$($params:ident),+]) => {}
}

fn_unimplemented_impl!(A, B, C, D, E, F);

pub extern "system" fn get_instance_proc_addr(
    instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<xr::pfn::VoidFunction>,
) -> xr::Result {
    let name = unsafe { CStr::from_ptr(name) };

    /// Generates match arms for supported functions. Names in parenthesis
    /// resolve to stubs that panic when called; implement them if a test
    /// needs one.
    macro_rules! get_fn {
        ([$($func:tt),+] $pat:pat => $expr:expr) => {
            get_fn!(@arm [$($func),+] -> [] {$pat => $expr})
        };
        (@arm [$name:ident $(,$rest:tt)*] -> [$($arms:tt),*] {$pat:pat => $expr:expr}) => {
            get_fn!(
                @arm
                [$($rest),*] ->
                [
                    $($arms,)*
                    [
                        x if x == const {
                            CStr::from_bytes_with_nul_unchecked(concat!("xr", stringify!($name), "\0").as_bytes())
                        } => Some(std::mem::transmute( paste! { [<$name:snake>] as xr::pfn::$name }))
                    ]
                ]
                {$pat => $expr}
            )
        };
        (@arm [($name:ident) $(,$rest:tt)*] -> [$($arms:tt),*] {$pat:pat => $expr:expr}) => {
            get_fn!(
                @arm
                [$($rest),*] ->
                [
                    $($arms,)*
                    [
                        x if x == const {
                            CStr::from_bytes_with_nul_unchecked(concat!("xr", stringify!($name), "\0").as_bytes())
                        } => Some(std::mem::transmute(xr::pfn::$name::unimplemented as xr::pfn::$name))
                    ]
                ]
                {$pat => $expr}
            )
        };
        (@arm []-> [$([$($arms:tt)*]),+] {$pat:pat => $expr:expr}) => {
            match name {
                $($($arms)*,)+
                $pat => $expr
            }
        }
    }

    if instance == xr::Instance::NULL {
        unsafe {
            *function = get_fn!([CreateInstance, EnumerateInstanceExtensionProperties, (EnumerateApiLayerProperties)]
                other => {
                    println!("unknown func without instance: {other:?}");
                    return xr::Result::ERROR_HANDLE_INVALID;
                }
            );
        }
    } else if name == c"xrGetOpenGLGraphicsRequirementsKHR" {
        // Matched outside the macro; its snake case is unguessable.
        unsafe {
            *function = Some(std::mem::transmute(
                gl_graphics_requirements as xr::pfn::GetOpenGLGraphicsRequirementsKHR,
            ));
        }
    } else {
        unsafe {
            *function = get_fn![[
                GetInstanceProcAddr,
                CreateInstance,
                DestroyInstance,
                (EnumerateInstanceExtensionProperties),
                (EnumerateApiLayerProperties),
                GetInstanceProperties,
                GetSystem,
                GetSystemProperties,
                EnumerateViewConfigurations,
                GetViewConfigurationProperties,
                EnumerateViewConfigurationViews,
                (EnumerateEnvironmentBlendModes),
                CreateSession,
                DestroySession,
                BeginSession,
                EndSession,
                (RequestExitSession),
                CreateReferenceSpace,
                (EnumerateReferenceSpaces),
                (GetReferenceSpaceBoundsRect),
                CreateActionSpace,
                DestroySpace,
                LocateSpace,
                LocateViews,
                PollEvent,
                (ResultToString),
                (StructureTypeToString),
                StringToPath,
                PathToString,
                EnumerateSwapchainFormats,
                CreateSwapchain,
                DestroySwapchain,
                EnumerateSwapchainImages,
                AcquireSwapchainImage,
                WaitSwapchainImage,
                ReleaseSwapchainImage,
                WaitFrame,
                BeginFrame,
                EndFrame,
                CreateActionSet,
                DestroyActionSet,
                CreateAction,
                DestroyAction,
                SuggestInteractionProfileBindings,
                AttachSessionActionSets,
                (GetCurrentInteractionProfile),
                SyncActions,
                GetActionStateBoolean,
                GetActionStateFloat,
                (GetActionStateVector2f),
                (GetActionStatePose),
                (EnumerateBoundSourcesForAction),
                (GetInputSourceLocalizedName),
                (ApplyHapticFeedback),
                (StopHapticFeedback)
                ]

                other => {
                    println!("unknown func: {other:?}");
                    return xr::Result::ERROR_FUNCTION_UNSUPPORTED;
                }
            ]
        }
    }

    xr::Result::SUCCESS
}

extern "system" fn enumerate_instance_extension_properties(
    layer_name: *const c_char,
    property_capacity_input: u32,
    property_count_output: *mut u32,
    properties: *mut xr::ExtensionProperties,
) -> xr::Result {
    assert!(layer_name.is_null());
    let names = [
        xr::KHR_OPENGL_ENABLE_EXTENSION_NAME,
        xr::KHR_COMPOSITION_LAYER_DEPTH_EXTENSION_NAME,
    ];
    unsafe { *property_count_output = names.len() as u32 };
    if property_capacity_input >= names.len() as u32 {
        let props =
            unsafe { std::slice::from_raw_parts_mut(properties, property_capacity_input as usize) };
        for (prop, name) in props.iter_mut().zip(names) {
            *prop = xr::ExtensionProperties {
                ty: xr::ExtensionProperties::TYPE,
                next: std::ptr::null_mut(),
                extension_name: [0 as c_char; xr::MAX_EXTENSION_NAME_SIZE],
                extension_version: 1,
            };
            let name =
                unsafe { std::slice::from_raw_parts(name.as_ptr() as *const c_char, name.len()) };
            prop.extension_name[..name.len()].copy_from_slice(name);
        }
    }
    xr::Result::SUCCESS
}

extern "system" fn create_instance(
    _info: *const xr::InstanceCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result {
    let (tx, rx) = mpsc::channel();

    let (left, right) = (
        "/user/hand/left".to_string(),
        "/user/hand/right".to_string(),
    );
    let mut paths = SlotMap::new();
    let mut string_to_path = HashMap::new();
    paths.insert_with_key(|key| {
        string_to_path.insert(left.clone(), key);
        left
    });
    paths.insert_with_key(|key| {
        string_to_path.insert(right.clone(), key);
        right
    });
    let inst = Arc::new(Instance {
        event_receiver: rx.into(),
        event_sender: tx,
        paths: Mutex::new(paths),
        string_to_path: Mutex::new(string_to_path),
        should_render: true.into(),
        fail_locate_views: false.into(),
        action_sets: Default::default(),
    });
    unsafe {
        *instance = inst.to_xr();
        CURRENT_INSTANCE.set(*instance);
    }
    xr::Result::SUCCESS
}

extern "system" fn destroy_instance(instance: xr::Instance) -> xr::Result {
    destroy_handle(instance)
}

extern "system" fn get_instance_properties(
    instance: xr::Instance,
    properties: *mut xr::InstanceProperties,
) -> xr::Result {
    let _ = get_handle!(instance);
    let mut runtime_name = [0 as c_char; xr::MAX_RUNTIME_NAME_SIZE];
    for (dst, src) in runtime_name.iter_mut().zip(b"fakexr\0") {
        *dst = *src as c_char;
    }
    unsafe {
        properties.write(xr::InstanceProperties {
            ty: xr::InstanceProperties::TYPE,
            next: std::ptr::null_mut(),
            runtime_version: xr::Version::new(1, 0, 0),
            runtime_name,
        });
    }
    xr::Result::SUCCESS
}

extern "system" fn get_system(
    _: xr::Instance,
    _: *const xr::SystemGetInfo,
    system_id: *mut xr::SystemId,
) -> xr::Result {
    unsafe { *system_id = xr::SystemId::from_raw(1) };
    xr::Result::SUCCESS
}

extern "system" fn get_system_properties(
    instance: xr::Instance,
    system_id: xr::SystemId,
    properties: *mut xr::SystemProperties,
) -> xr::Result {
    let _ = get_handle!(instance);
    let mut system_name = [0 as c_char; xr::MAX_SYSTEM_NAME_SIZE];
    for (dst, src) in system_name.iter_mut().zip(b"Fake HMD\0") {
        *dst = *src as c_char;
    }
    unsafe {
        properties.write(xr::SystemProperties {
            ty: xr::SystemProperties::TYPE,
            next: std::ptr::null_mut(),
            system_id,
            vendor_id: 0xF4CE,
            system_name,
            graphics_properties: xr::SystemGraphicsProperties {
                max_swapchain_image_height: 4096,
                max_swapchain_image_width: 4096,
                max_layer_count: 16,
            },
            tracking_properties: xr::SystemTrackingProperties {
                orientation_tracking: true.into(),
                position_tracking: true.into(),
            },
        });
    }
    xr::Result::SUCCESS
}

extern "system" fn gl_graphics_requirements(
    instance: xr::Instance,
    _system_id: xr::SystemId,
    requirements: *mut xr::GraphicsRequirementsOpenGLKHR,
) -> xr::Result {
    let _ = get_handle!(instance);
    unsafe {
        requirements.write(xr::GraphicsRequirementsOpenGLKHR {
            ty: xr::GraphicsRequirementsOpenGLKHR::TYPE,
            next: std::ptr::null_mut(),
            min_api_version_supported: xr::Version::new(3, 0, 0),
            max_api_version_supported: xr::Version::new(4, 6, 0),
        });
    }
    xr::Result::SUCCESS
}

extern "system" fn enumerate_view_configurations(
    instance: xr::Instance,
    _system_id: xr::SystemId,
    capacity: u32,
    count_output: *mut u32,
    types: *mut xr::ViewConfigurationType,
) -> xr::Result {
    let _ = get_handle!(instance);
    unsafe { count_output.write(1) };
    if capacity >= 1 {
        unsafe { types.write(xr::ViewConfigurationType::PRIMARY_STEREO) };
    }
    xr::Result::SUCCESS
}

extern "system" fn get_view_configuration_properties(
    instance: xr::Instance,
    _system_id: xr::SystemId,
    ty: xr::ViewConfigurationType,
    properties: *mut xr::ViewConfigurationProperties,
) -> xr::Result {
    let _ = get_handle!(instance);
    unsafe {
        properties.write(xr::ViewConfigurationProperties {
            ty: xr::ViewConfigurationProperties::TYPE,
            next: std::ptr::null_mut(),
            view_configuration_type: ty,
            fov_mutable: false.into(),
        });
    }
    xr::Result::SUCCESS
}

extern "system" fn enumerate_view_configuration_views(
    instance: xr::Instance,
    _system_id: xr::SystemId,
    _ty: xr::ViewConfigurationType,
    capacity: u32,
    count_output: *mut u32,
    views: *mut xr::ViewConfigurationView,
) -> xr::Result {
    let _ = get_handle!(instance);
    unsafe { count_output.write(2) };
    if capacity >= 2 {
        let view = xr::ViewConfigurationView {
            ty: xr::ViewConfigurationView::TYPE,
            next: std::ptr::null_mut(),
            recommended_image_rect_width: VIEW_WIDTH,
            max_image_rect_width: VIEW_WIDTH * 2,
            recommended_image_rect_height: VIEW_HEIGHT,
            max_image_rect_height: VIEW_HEIGHT * 2,
            recommended_swapchain_sample_count: 1,
            max_swapchain_sample_count: 4,
        };
        let views = unsafe { std::slice::from_raw_parts_mut(views, capacity as usize) };
        views[0] = view;
        views[1] = view;
    }
    xr::Result::SUCCESS
}

extern "system" fn create_session(
    instance: xr::Instance,
    create_info: *const xr::SessionCreateInfo,
    session: *mut xr::Session,
) -> xr::Result {
    let instance = get_handle!(instance);
    let info = unsafe { create_info.as_ref().unwrap() };
    let binding = unsafe {
        (info.next as *const xr::GraphicsBindingOpenGLXlibKHR)
            .as_ref()
            .unwrap()
    };
    assert_eq!(binding.ty, xr::GraphicsBindingOpenGLXlibKHR::TYPE);

    let sess = Arc::new(Session {
        instance: Arc::downgrade(&instance),
        event_sender: instance.event_sender.clone(),
        running: false.into(),
        focused: false.into(),
        frame_waited: false.into(),
        frame_active: false.into(),
        frame_counter: 0.into(),
        frames_ended: 0.into(),
        swapchains_created: 0.into(),
        attached_sets: OnceLock::new(),
        left_hand: Default::default(),
        right_hand: Default::default(),
        view_pose: xr::Posef::IDENTITY.into(),
        spaces: Default::default(),
        last_ref_space_pose: Default::default(),
        last_layers: Default::default(),
    });

    let tx = sess.event_sender.clone();
    unsafe {
        *session = sess.to_xr();
        CURRENT_SESSION.set(*session);
    }

    for state in [xr::SessionState::IDLE, xr::SessionState::READY] {
        send_event(
            &tx,
            xr::EventDataSessionStateChanged {
                ty: xr::EventDataSessionStateChanged::TYPE,
                next: std::ptr::null(),
                session: unsafe { *session },
                state,
                time: xr::Time::from_nanos(0),
            },
        );
    }

    xr::Result::SUCCESS
}

extern "system" fn destroy_session(session: xr::Session) -> xr::Result {
    destroy_handle(session)
}

extern "system" fn begin_session(
    session: xr::Session,
    _info: *const xr::SessionBeginInfo,
) -> xr::Result {
    let sess = get_handle!(session);
    if sess.running.swap(true, Ordering::Relaxed) {
        return xr::Result::ERROR_SESSION_RUNNING;
    }
    sess.focused.store(true, Ordering::Relaxed);
    for state in [
        xr::SessionState::SYNCHRONIZED,
        xr::SessionState::VISIBLE,
        xr::SessionState::FOCUSED,
    ] {
        send_event(
            &sess.event_sender,
            xr::EventDataSessionStateChanged {
                ty: xr::EventDataSessionStateChanged::TYPE,
                next: std::ptr::null(),
                session,
                state,
                time: xr::Time::from_nanos(0),
            },
        );
    }
    xr::Result::SUCCESS
}

extern "system" fn end_session(session: xr::Session) -> xr::Result {
    let sess = get_handle!(session);
    if !sess.running.swap(false, Ordering::Relaxed) {
        return xr::Result::ERROR_SESSION_NOT_RUNNING;
    }
    sess.focused.store(false, Ordering::Relaxed);
    // A wait issued for the next frame may be outstanding; it dies with
    // the run.
    sess.frame_waited.store(false, Ordering::Relaxed);
    sess.frame_active.store(false, Ordering::Relaxed);
    xr::Result::SUCCESS
}

extern "system" fn create_reference_space(
    session: xr::Session,
    create_info: *const xr::ReferenceSpaceCreateInfo,
    space: *mut xr::Space,
) -> xr::Result {
    let sess = get_handle!(session);
    let info = unsafe { create_info.as_ref().unwrap() };
    sess.last_ref_space_pose.lock().unwrap().insert(
        info.reference_space_type.into_raw(),
        info.pose_in_reference_space,
    );

    let s = Arc::new(Space {
        session: Arc::downgrade(&sess),
        role: SpaceRole::Reference(info.reference_space_type),
        offset: info.pose_in_reference_space,
    });
    let key = Space::instances().insert(s);
    sess.spaces.lock().unwrap().insert(key);
    unsafe { space.write(xr::Space::from_raw(key.data().as_ffi())) };
    xr::Result::SUCCESS
}

extern "system" fn create_action_space(
    session: xr::Session,
    info: *const xr::ActionSpaceCreateInfo,
    space: *mut xr::Space,
) -> xr::Result {
    let sess = get_handle!(session);
    let info = unsafe { info.as_ref() }.unwrap();
    let action = get_handle!(info.action);

    let Some(instance) = sess.instance.upgrade() else {
        return xr::Result::ERROR_INSTANCE_LOST;
    };
    let Ok(hand) = instance.get_user_path(info.subaction_path) else {
        return xr::Result::ERROR_PATH_INVALID;
    };
    let s = Arc::new(Space {
        session: Arc::downgrade(&sess),
        role: SpaceRole::Action {
            action: Arc::downgrade(&action),
            hand,
        },
        offset: info.pose_in_action_space,
    });
    let key = Space::instances().insert(s);
    sess.spaces.lock().unwrap().insert(key);
    unsafe { space.write(xr::Space::from_raw(key.data().as_ffi())) };
    xr::Result::SUCCESS
}

extern "system" fn destroy_space(space: xr::Space) -> xr::Result {
    destroy_handle(space)
}

extern "system" fn locate_space(
    space: xr::Space,
    base_space: xr::Space,
    _time: xr::Time,
    location: *mut xr::SpaceLocation,
) -> xr::Result {
    let space = get_handle!(space);
    let base = get_handle!(base_space);

    let mut out = xr::SpaceLocation {
        ty: xr::SpaceLocation::TYPE,
        next: unsafe { (*location).next },
        location_flags: xr::SpaceLocationFlags::EMPTY,
        pose: xr::Posef::IDENTITY,
    };

    let target_pose = match space.world_pose() {
        Ok(pose) => pose,
        Err(err) => return err,
    };
    let base_pose = match base.world_pose() {
        Ok(pose) => pose,
        Err(err) => return err,
    };
    if let (Some(target), Some(base)) = (target_pose, base_pose) {
        out.location_flags = *LOCATION_FLAGS_TRACKED;
        out.pose = mat_to_pose(pose_to_mat(base).inverse() * pose_to_mat(target));
    }

    unsafe { location.write(out) };
    xr::Result::SUCCESS
}

extern "system" fn locate_views(
    session: xr::Session,
    info: *const xr::ViewLocateInfo,
    state: *mut xr::ViewState,
    capacity: u32,
    count_output: *mut u32,
    views: *mut xr::View,
) -> xr::Result {
    let sess = get_handle!(session);
    let instance = sess.instance.upgrade().unwrap();
    if instance.fail_locate_views.swap(false, Ordering::Relaxed) {
        return xr::Result::ERROR_RUNTIME_FAILURE;
    }

    if !state.is_null() {
        unsafe {
            state.write(xr::ViewState {
                ty: xr::ViewState::TYPE,
                next: std::ptr::null_mut(),
                view_state_flags: xr::ViewStateFlags::POSITION_VALID
                    | xr::ViewStateFlags::ORIENTATION_VALID,
            });
        }
    }
    unsafe { count_output.write(2) };

    if capacity > 0 {
        if capacity < 2 {
            return xr::Result::ERROR_SIZE_INSUFFICIENT;
        }
        let info = unsafe { info.as_ref().unwrap() };
        let base = get_handle!(info.space);
        let Ok(Some(base_pose)) = base.world_pose() else {
            return xr::Result::ERROR_RUNTIME_FAILURE;
        };
        let base_mat = pose_to_mat(base_pose);
        let head = pose_to_mat(sess.view_pose.load());

        let fov = xr::Fovf {
            angle_left: -std::f32::consts::FRAC_PI_4,
            angle_right: std::f32::consts::FRAC_PI_4,
            angle_up: std::f32::consts::FRAC_PI_4,
            angle_down: -std::f32::consts::FRAC_PI_4,
        };
        let out = unsafe { std::slice::from_raw_parts_mut(views, capacity as usize) };
        for (i, view) in out.iter_mut().take(2).enumerate() {
            let eye_x = if i == 0 { -IPD / 2.0 } else { IPD / 2.0 };
            let eye = head * Affine3A::from_translation(Vec3::new(eye_x, 0.0, 0.0));
            *view = xr::View {
                ty: xr::View::TYPE,
                next: std::ptr::null_mut(),
                pose: mat_to_pose(base_mat.inverse() * eye),
                fov,
            };
        }
    }

    xr::Result::SUCCESS
}

extern "system" fn poll_event(
    instance: xr::Instance,
    buffer: *mut xr::EventDataBuffer,
) -> xr::Result {
    let instance = get_handle!(instance);
    let recv = instance.event_receiver.lock().unwrap();
    match recv.try_recv() {
        Ok(event) => {
            unsafe {
                buffer
                    .cast::<u8>()
                    .copy_from(event.0.as_ptr(), event.0.len());
            }
            xr::Result::SUCCESS
        }
        Err(mpsc::TryRecvError::Empty) => xr::Result::EVENT_UNAVAILABLE,
        Err(mpsc::TryRecvError::Disconnected) => unreachable!(),
    }
}

extern "system" fn string_to_path(
    instance: xr::Instance,
    string: *const c_char,
    path: *mut xr::Path,
) -> xr::Result {
    let instance = get_handle!(instance);
    let s = unsafe { CStr::from_ptr(string) }.to_str().unwrap();
    let mut string_to_path = instance.string_to_path.lock().unwrap();
    let key = match string_to_path.get(s) {
        Some(p) => *p,
        None => {
            let mut paths = instance.paths.lock().unwrap();
            let key = paths.insert(s.to_string());
            string_to_path.insert(s.to_string(), key);
            key
        }
    };

    unsafe { path.write(xr::Path::from_raw(key.data().as_ffi())) };

    xr::Result::SUCCESS
}

extern "system" fn path_to_string(
    instance: xr::Instance,
    path: xr::Path,
    capacity: u32,
    output: *mut u32,
    buffer: *mut c_char,
) -> xr::Result {
    let instance = get_handle!(instance);
    let key = DefaultKey::from(KeyData::from_ffi(path.into_raw()));
    let paths = instance.paths.lock().unwrap();
    let Some(val) = paths.get(key) else {
        return xr::Result::ERROR_PATH_INVALID;
    };
    let buf = [val.as_bytes(), &[0]].concat();
    unsafe { output.write(buf.len() as u32) };
    if capacity > 0 && capacity >= buf.len() as u32 {
        let out = unsafe { std::slice::from_raw_parts_mut(buffer as *mut _, capacity as usize) };
        out[0..buf.len()].copy_from_slice(&buf);
    }

    xr::Result::SUCCESS
}

extern "system" fn enumerate_swapchain_formats(
    session: xr::Session,
    capacity: u32,
    count_output: *mut u32,
    formats: *mut i64,
) -> xr::Result {
    let _ = get_handle!(session);
    let supported = [
        GL_SRGB8_ALPHA8,
        GL_RGBA8,
        GL_DEPTH_COMPONENT32F,
        GL_DEPTH_COMPONENT24,
    ];
    unsafe { count_output.write(supported.len() as u32) };
    if capacity >= supported.len() as u32 {
        let out = unsafe { std::slice::from_raw_parts_mut(formats, supported.len()) };
        out.copy_from_slice(&supported);
    }
    xr::Result::SUCCESS
}

extern "system" fn create_swapchain(
    session: xr::Session,
    info: *const xr::SwapchainCreateInfo,
    swapchain: *mut xr::Swapchain,
) -> xr::Result {
    let sess = get_handle!(session);
    let info = unsafe { info.as_ref() }.unwrap();
    if info.width == 0 || info.height == 0 {
        return xr::Result::ERROR_VALIDATION_FAILURE;
    }
    sess.swapchains_created.fetch_add(1, Ordering::Relaxed);

    static NEXT_IMAGE: AtomicU32 = AtomicU32::new(100);
    let base = NEXT_IMAGE.fetch_add(SWAPCHAIN_LENGTH, Ordering::Relaxed);
    let swap = Arc::new(Swapchain {
        images: (base..base + SWAPCHAIN_LENGTH).collect(),
        acquired: None.into(),
        next_index: 0.into(),
    });
    unsafe {
        swapchain.write(swap.to_xr());
    }
    xr::Result::SUCCESS
}

extern "system" fn destroy_swapchain(swapchain: xr::Swapchain) -> xr::Result {
    destroy_handle(swapchain)
}

extern "system" fn enumerate_swapchain_images(
    swapchain: xr::Swapchain,
    capacity: u32,
    count_output: *mut u32,
    images: *mut xr::SwapchainImageBaseHeader,
) -> xr::Result {
    let swapchain = get_handle!(swapchain);
    unsafe { count_output.write(swapchain.images.len() as u32) };
    if capacity >= swapchain.images.len() as u32 {
        let out = unsafe {
            std::slice::from_raw_parts_mut(
                images as *mut xr::SwapchainImageOpenGLKHR,
                swapchain.images.len(),
            )
        };
        for (slot, image) in out.iter_mut().zip(swapchain.images.iter()) {
            assert_eq!(slot.ty, xr::SwapchainImageOpenGLKHR::TYPE);
            slot.image = *image;
        }
    }
    xr::Result::SUCCESS
}

extern "system" fn acquire_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageAcquireInfo,
    index: *mut u32,
) -> xr::Result {
    let swapchain = get_handle!(swapchain);
    if swapchain.acquired.load().is_some() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    let next = swapchain.next_index.load(Ordering::Relaxed) % swapchain.images.len() as u32;
    swapchain.acquired.store(Some(next));
    unsafe { index.write(next) };
    xr::Result::SUCCESS
}

extern "system" fn wait_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageWaitInfo,
) -> xr::Result {
    let swapchain = get_handle!(swapchain);
    if swapchain.acquired.load().is_none() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    xr::Result::SUCCESS
}

extern "system" fn release_swapchain_image(
    swapchain: xr::Swapchain,
    _info: *const xr::SwapchainImageReleaseInfo,
) -> xr::Result {
    let swapchain = get_handle!(swapchain);
    if swapchain.acquired.take().is_none() {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    swapchain.next_index.fetch_add(1, Ordering::Relaxed);
    xr::Result::SUCCESS
}

extern "system" fn wait_frame(
    session: xr::Session,
    _info: *const xr::FrameWaitInfo,
    state: *mut xr::FrameState,
) -> xr::Result {
    let sess = get_handle!(session);
    if !sess.running.load(Ordering::Relaxed) {
        return xr::Result::ERROR_SESSION_NOT_RUNNING;
    }
    if sess.frame_waited.swap(true, Ordering::Relaxed) {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    let instance = sess.instance.upgrade().unwrap();
    let frame = sess.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    unsafe {
        state.write(xr::FrameState {
            ty: xr::FrameState::TYPE,
            next: std::ptr::null_mut(),
            predicted_display_time: xr::Time::from_nanos(frame as i64 * 16_000_000),
            predicted_display_period: xr::Duration::from_nanos(16_000_000),
            should_render: instance.should_render.load(Ordering::Relaxed).into(),
        })
    }
    xr::Result::SUCCESS
}

extern "system" fn begin_frame(
    session: xr::Session,
    _info: *const xr::FrameBeginInfo,
) -> xr::Result {
    let sess = get_handle!(session);
    if !sess.frame_waited.swap(false, Ordering::Relaxed) {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    if sess.frame_active.swap(true, Ordering::Relaxed) {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    xr::Result::SUCCESS
}

extern "system" fn end_frame(session: xr::Session, info: *const xr::FrameEndInfo) -> xr::Result {
    let sess = get_handle!(session);
    if !sess.frame_active.swap(false, Ordering::Relaxed) {
        return xr::Result::ERROR_CALL_ORDER_INVALID;
    }
    sess.frames_ended.fetch_add(1, Ordering::Relaxed);

    let info = unsafe { info.as_ref().unwrap() };
    let mut captured = Vec::new();
    if !info.layers.is_null() {
        let layers = unsafe { std::slice::from_raw_parts(info.layers, info.layer_count as usize) };
        for layer in layers {
            let header = unsafe { layer.as_ref().unwrap() };
            let mut summary = SubmittedLayer {
                ty: header.ty,
                view_count: 0,
                pose: xr::Posef::IDENTITY,
                size: xr::Extent2Df {
                    width: 0.0,
                    height: 0.0,
                },
            };
            match header.ty {
                xr::StructureType::COMPOSITION_LAYER_PROJECTION => {
                    let projection = unsafe { &*(*layer as *const xr::CompositionLayerProjection) };
                    summary.view_count = projection.view_count;
                }
                xr::StructureType::COMPOSITION_LAYER_QUAD => {
                    let quad = unsafe { &*(*layer as *const xr::CompositionLayerQuad) };
                    summary.pose = quad.pose;
                    summary.size = quad.size;
                }
                _ => {}
            }
            captured.push(summary);
        }
    }
    *sess.last_layers.lock().unwrap() = captured;
    xr::Result::SUCCESS
}

extern "system" fn create_action_set(
    instance: xr::Instance,
    info: *const xr::ActionSetCreateInfo,
    set: *mut xr::ActionSet,
) -> xr::Result {
    let instance = get_handle!(instance);
    let Some(info) = (unsafe { info.as_ref() }) else {
        return xr::Result::ERROR_VALIDATION_FAILURE;
    };

    let name = unsafe { CStr::from_ptr(info.action_set_name.as_ptr()) }.to_owned();
    let s = Arc::new(ActionSet {
        instance: Arc::downgrade(&instance),
        name,
        actions: OnceLock::new(),
        pending_actions: Mutex::default(),
        active: false.into(),
    });

    unsafe {
        *set = s.to_xr();
        instance.action_sets.lock().unwrap().insert(*set);
    }
    xr::Result::SUCCESS
}

extern "system" fn destroy_action_set(set: xr::ActionSet) -> xr::Result {
    let set_handle = get_handle!(set);
    if let Some(instance) = set_handle.instance.upgrade() {
        instance.action_sets.lock().unwrap().remove(&set);
    }
    destroy_handle(set)
}

extern "system" fn create_action(
    set: xr::ActionSet,
    info: *const xr::ActionCreateInfo,
    action: *mut xr::Action,
) -> xr::Result {
    let set = get_handle!(set);
    if set.actions.get().is_some() {
        return xr::Result::ERROR_ACTIONSETS_ALREADY_ATTACHED;
    }

    let info = unsafe { info.as_ref().unwrap() };
    let name = CStr::from_bytes_until_nul(unsafe {
        std::slice::from_raw_parts(info.action_name.as_ptr() as _, info.action_name.len())
    })
    .unwrap();

    let state = match info.action_type {
        xr::ActionType::BOOLEAN_INPUT => ActionState::Bool(false),
        xr::ActionType::FLOAT_INPUT => ActionState::Float(0.0),
        xr::ActionType::POSE_INPUT => ActionState::Pose,
        other => unimplemented!("unhandled action type: {other:?}"),
    };
    let a = Arc::new(Action {
        active: false.into(),
        name: name.to_owned(),
        state: LeftRight {
            left: state.into(),
            right: state.into(),
        },
        pending: Default::default(),
        suggested: Mutex::default(),
    });

    set.pending_actions.lock().unwrap().push(a.clone());
    unsafe {
        *action = a.to_xr();
    }
    xr::Result::SUCCESS
}

extern "system" fn destroy_action(action: xr::Action) -> xr::Result {
    destroy_handle(action)
}

extern "system" fn suggest_interaction_profile_bindings(
    instance: xr::Instance,
    binding: *const xr::InteractionProfileSuggestedBinding,
) -> xr::Result {
    let _ = get_handle!(instance);
    let binding = unsafe { binding.as_ref().unwrap() };

    let profile_path = binding.interaction_profile;
    let bindings = unsafe {
        std::slice::from_raw_parts(
            binding.suggested_bindings,
            binding.count_suggested_bindings as usize,
        )
    };

    for xr::ActionSuggestedBinding { action, binding } in bindings.iter().copied() {
        let action = get_handle!(action);
        action
            .suggested
            .lock()
            .unwrap()
            .entry(profile_path)
            .or_default()
            .push(binding);
    }

    xr::Result::SUCCESS
}

extern "system" fn attach_session_action_sets(
    session: xr::Session,
    info: *const xr::SessionActionSetsAttachInfo,
) -> xr::Result {
    let sess = get_handle!(session);
    let sets =
        unsafe { std::slice::from_raw_parts((*info).action_sets, (*info).count_action_sets as _) };
    if sess.attached_sets.set(sets.into()).is_ok() {
        for set in sess.attached_sets.get().unwrap() {
            let set = get_handle!(*set);
            set.make_immutable();
        }
        xr::Result::SUCCESS
    } else {
        xr::Result::ERROR_ACTIONSETS_ALREADY_ATTACHED
    }
}

extern "system" fn sync_actions(
    session: xr::Session,
    info: *const xr::ActionsSyncInfo,
) -> xr::Result {
    let session = get_handle!(session);
    if !session.focused.load(Ordering::Relaxed) {
        return xr::Result::SESSION_NOT_FOCUSED;
    }
    let Some(attached) = session.attached_sets.get() else {
        return xr::Result::ERROR_ACTIONSET_NOT_ATTACHED;
    };
    for set in attached {
        let set = get_handle!(*set);
        set.active.store(false, Ordering::Relaxed);
    }
    let sets = unsafe {
        std::slice::from_raw_parts(
            (*info).active_action_sets,
            (*info).count_active_action_sets as _,
        )
    };
    for set in sets {
        if !attached.contains(&set.action_set) {
            return xr::Result::ERROR_ACTIONSET_NOT_ATTACHED;
        }
        let set = get_handle!(set.action_set);
        let Some(actions) = set.actions.get() else {
            return xr::Result::ERROR_ACTIONSET_NOT_ATTACHED;
        };
        set.active.store(true, Ordering::Relaxed);

        for action in actions {
            let pending = action.pending.take();
            for (new, state) in [
                (pending.left, &action.state.left),
                (pending.right, &action.state.right),
            ] {
                if let Some(new_state) = new {
                    state.store(new_state);
                }
            }
        }
    }

    xr::Result::SUCCESS
}

fn get_action_if_attached(
    session: &Session,
    info: *const xr::ActionStateGetInfo,
) -> Option<(Arc<ActionSet>, Arc<Action>)> {
    let sets = session.attached_sets.get()?;
    let action = xr::Action::to_handle(unsafe { (*info).action })?;
    sets.iter().find_map(|set| {
        let set = xr::ActionSet::to_handle(*set)?;
        for a in set.actions.get().unwrap() {
            if Arc::as_ptr(a) == Arc::as_ptr(&action) {
                return Some((set, action.clone()));
            }
        }
        None
    })
}

extern "system" fn get_action_state_boolean(
    session: xr::Session,
    info: *const xr::ActionStateGetInfo,
    state: *mut xr::ActionStateBoolean,
) -> xr::Result {
    unsafe {
        state.write(xr::ActionStateBoolean {
            ty: xr::ActionStateBoolean::TYPE,
            next: std::ptr::null_mut(),
            current_state: false.into(),
            changed_since_last_sync: false.into(),
            last_change_time: xr::Time::from_nanos(0),
            is_active: false.into(),
        });
    }
    let session = get_handle!(session);
    let Some((set, action)) = get_action_if_attached(&session, info) else {
        return xr::Result::ERROR_ACTIONSET_NOT_ATTACHED;
    };

    let info = unsafe { info.as_ref().unwrap() };
    let instance = session.instance.upgrade().unwrap();
    let ActionState::Bool(value) = action.hand_state(&instance, info.subaction_path) else {
        return xr::Result::ERROR_ACTION_TYPE_MISMATCH;
    };
    let state = unsafe { state.as_mut().unwrap() };
    if set.active.load(Ordering::Relaxed) {
        let active = action.active.load(Ordering::Relaxed);
        if active {
            state.current_state = value.into();
        }
        state.is_active = active.into();
    }
    xr::Result::SUCCESS
}

extern "system" fn get_action_state_float(
    session: xr::Session,
    info: *const xr::ActionStateGetInfo,
    state: *mut xr::ActionStateFloat,
) -> xr::Result {
    unsafe {
        state.write(xr::ActionStateFloat {
            ty: xr::ActionStateFloat::TYPE,
            next: std::ptr::null_mut(),
            current_state: 0.0,
            changed_since_last_sync: false.into(),
            last_change_time: xr::Time::from_nanos(0),
            is_active: false.into(),
        });
    }
    let session = get_handle!(session);
    let Some((set, action)) = get_action_if_attached(&session, info) else {
        return xr::Result::ERROR_ACTIONSET_NOT_ATTACHED;
    };
    let instance = session.instance.upgrade().unwrap();
    let ActionState::Float(value) = action.hand_state(&instance, unsafe { (*info).subaction_path })
    else {
        return xr::Result::ERROR_ACTION_TYPE_MISMATCH;
    };
    let state = unsafe { state.as_mut().unwrap() };
    if set.active.load(Ordering::Relaxed) {
        let active = action.active.load(Ordering::Relaxed);
        if active {
            state.current_state = value;
        }
        state.is_active = active.into();
    }
    xr::Result::SUCCESS
}
