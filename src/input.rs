use crate::{
    error::{check, SessionLost},
    math,
    types::{Button, InputPose, InputState},
};
use log::error;
use openxr as xr;

const HAND_PATHS: [&str; 2] = ["/user/hand/left", "/user/hand/right"];

/// The fixed action layout: one set, six actions, each declared for both
/// hand subaction paths, plus a grip and aim space per hand.
pub(crate) struct Input {
    session: xr::Session<xr::OpenGL>,
    action_set: xr::ActionSet,
    hand_paths: [xr::Path; 2],

    grip_pose: xr::Action<xr::Posef>,
    aim_pose: xr::Action<xr::Posef>,
    attack_click: xr::Action<bool>,
    attack_trigger: xr::Action<f32>,
    use_click: xr::Action<bool>,
    menu_click: xr::Action<bool>,

    grip_spaces: [xr::Space; 2],
    aim_spaces: [xr::Space; 2],

    state: InputState,
}

impl Input {
    pub fn new(
        instance: &xr::Instance,
        session: &xr::Session<xr::OpenGL>,
    ) -> Result<Self, SessionLost> {
        let action_set = check(
            instance.create_action_set("mainactions", "Main Actions", 0),
            "xrCreateActionSet",
        )?;
        let hand_paths = [
            check(instance.string_to_path(HAND_PATHS[0]), "xrStringToPath")?,
            check(instance.string_to_path(HAND_PATHS[1]), "xrStringToPath")?,
        ];

        let grip_pose = check(
            action_set.create_action::<xr::Posef>("grippose", "Grip Pose", &hand_paths),
            "xrCreateAction",
        )?;
        let aim_pose = check(
            action_set.create_action::<xr::Posef>("aimpose", "Aim Pose", &hand_paths),
            "xrCreateAction",
        )?;
        let attack_click = check(
            action_set.create_action::<bool>("attack", "Attack", &hand_paths),
            "xrCreateAction",
        )?;
        let attack_trigger = check(
            action_set.create_action::<f32>("trigger", "Trigger", &hand_paths),
            "xrCreateAction",
        )?;
        let use_click = check(
            action_set.create_action::<bool>("use", "Use/Interact", &hand_paths),
            "xrCreateAction",
        )?;
        let menu_click = check(
            action_set.create_action::<bool>("menu", "Open Menu", &hand_paths),
            "xrCreateAction",
        )?;

        let make_spaces = |action: &xr::Action<xr::Posef>| -> Result<[xr::Space; 2], SessionLost> {
            Ok([
                check(
                    action.create_space(session.clone(), hand_paths[0], xr::Posef::IDENTITY),
                    "xrCreateActionSpace",
                )?,
                check(
                    action.create_space(session.clone(), hand_paths[1], xr::Posef::IDENTITY),
                    "xrCreateActionSpace",
                )?,
            ])
        };
        let grip_spaces = make_spaces(&grip_pose)?;
        let aim_spaces = make_spaces(&aim_pose)?;

        let input = Self {
            session: session.clone(),
            action_set,
            hand_paths,
            grip_pose,
            aim_pose,
            attack_click,
            attack_trigger,
            use_click,
            menu_click,
            grip_spaces,
            aim_spaces,
            state: InputState::default(),
        };
        input.suggest_bindings(instance)?;
        check(
            session.attach_action_sets(&[&input.action_set]),
            "xrAttachSessionActionSets",
        )?;
        Ok(input)
    }

    /// Default binding recommendations. The runtime is free to alter these,
    /// and may let the user remap and save changes. The trigger value
    /// action is declared but not bound by either profile; it reports zero
    /// until a runtime binds it.
    fn suggest_bindings(&self, instance: &xr::Instance) -> Result<(), SessionLost> {
        fn both_hands<'a, T: xr::ActionTy>(
            instance: &xr::Instance,
            bindings: &mut Vec<xr::Binding<'a>>,
            action: &'a xr::Action<T>,
            suffix: &str,
        ) -> Result<(), SessionLost> {
            for hand in HAND_PATHS {
                let path = check(
                    instance.string_to_path(&format!("{hand}{suffix}")),
                    "xrStringToPath",
                )?;
                bindings.push(xr::Binding::new(action, path));
            }
            Ok(())
        }

        // The simple profile only has two buttons.
        let mut bindings = Vec::new();
        both_hands(instance, &mut bindings, &self.grip_pose, "/input/grip/pose")?;
        both_hands(instance, &mut bindings, &self.aim_pose, "/input/aim/pose")?;
        both_hands(
            instance,
            &mut bindings,
            &self.attack_click,
            "/input/select/click",
        )?;
        both_hands(instance, &mut bindings, &self.use_click, "/input/menu/click")?;
        let simple = check(
            instance.string_to_path("/interaction_profiles/khr/simple_controller"),
            "xrStringToPath",
        )?;
        check(
            instance.suggest_interaction_profile_bindings(simple, &bindings),
            "xrSuggestInteractionProfileBindings",
        )?;

        let mut bindings = Vec::new();
        both_hands(instance, &mut bindings, &self.grip_pose, "/input/grip/pose")?;
        both_hands(instance, &mut bindings, &self.aim_pose, "/input/aim/pose")?;
        both_hands(
            instance,
            &mut bindings,
            &self.attack_click,
            "/input/trigger/click",
        )?;
        both_hands(instance, &mut bindings, &self.use_click, "/input/a/click")?;
        both_hands(instance, &mut bindings, &self.menu_click, "/input/b/click")?;
        let index = check(
            instance.string_to_path("/interaction_profiles/valve/index_controller"),
            "xrStringToPath",
        )?;
        check(
            instance.suggest_interaction_profile_bindings(index, &bindings),
            "xrSuggestInteractionProfileBindings",
        )
    }

    /// Refresh the snapshot for the frame at `predicted_display_time`. Runs
    /// right after `xrWaitFrame`, with poses located in the play space.
    pub fn sync(
        &mut self,
        predicted_display_time: xr::Time,
        base_space: &xr::Space,
    ) -> Result<(), SessionLost> {
        // The wrapped sync_actions folds SESSION_NOT_FOCUSED into Ok, but
        // the distinction matters here: not-focused is expected while the
        // session state event is still in flight, and must zero the
        // snapshot rather than tear the session down.
        let active_sets = [xr::sys::ActiveActionSet {
            action_set: self.action_set.as_raw(),
            subaction_path: xr::Path::NULL,
        }];
        let sync_info = xr::sys::ActionsSyncInfo {
            ty: xr::sys::ActionsSyncInfo::TYPE,
            next: std::ptr::null(),
            count_active_action_sets: active_sets.len() as u32,
            active_action_sets: active_sets.as_ptr(),
        };
        let result = unsafe {
            (self.session.instance().fp().sync_actions)(self.session.as_raw(), &sync_info)
        };
        match result {
            xr::sys::Result::SUCCESS => {}
            xr::sys::Result::SESSION_NOT_FOCUSED => {
                self.state = InputState::default();
                return Ok(());
            }
            err => {
                error!("xrSyncActions error: {err:?}");
                return Err(SessionLost(err));
            }
        }

        for hand in 0..2 {
            let mut state = self.state.hands[hand];
            state.aim =
                self.locate_pose(&self.aim_spaces[hand], base_space, predicted_display_time)?;
            state.grip =
                self.locate_pose(&self.grip_spaces[hand], base_space, predicted_display_time)?;
            state.attack = self.read_button(
                hand,
                Some(&self.attack_click),
                None,
                Some(&self.attack_trigger),
            )?;
            state.interact = self.read_button(hand, Some(&self.use_click), None, None)?;
            state.menu = self.read_button(hand, Some(&self.menu_click), None, None)?;
            self.state.hands[hand] = state;
        }
        Ok(())
    }

    fn locate_pose(
        &self,
        space: &xr::Space,
        base_space: &xr::Space,
        time: xr::Time,
    ) -> Result<InputPose, SessionLost> {
        let location = check(space.locate(base_space, time), "xrLocateSpace")?;
        let valid = location.location_flags.contains(
            xr::SpaceLocationFlags::ORIENTATION_VALID | xr::SpaceLocationFlags::POSITION_VALID,
        );
        Ok(InputPose {
            valid,
            pose: if valid {
                math::pose_from_xr(location.pose)
            } else {
                Default::default()
            },
        })
    }

    /// Unbound channels report zero/false.
    fn read_button(
        &self,
        hand: usize,
        click: Option<&xr::Action<bool>>,
        touch: Option<&xr::Action<bool>>,
        value: Option<&xr::Action<f32>>,
    ) -> Result<Button, SessionLost> {
        let path = self.hand_paths[hand];
        let mut button = Button::default();
        if let Some(click) = click {
            let state = check(click.state(&self.session, path), "xrGetActionStateBoolean")?;
            button.pressed = state.current_state;
        }
        if let Some(touch) = touch {
            let state = check(touch.state(&self.session, path), "xrGetActionStateBoolean")?;
            button.touched = state.current_state;
        }
        if let Some(value) = value {
            let state = check(value.state(&self.session, path), "xrGetActionStateFloat")?;
            button.value = state.current_state;
        }
        Ok(button)
    }

    pub fn state(&self) -> InputState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use crate::test_util::{test_config, Fixture};
    use fakexr::{ActionState, UserPath};

    #[test]
    fn select_press_reaches_snapshot() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        fakexr::set_action_state(session, "attack", ActionState::Bool(true), UserPath::RightHand);

        // The press is picked up by the sync that follows xrWaitFrame.
        assert!(f.connector.try_begin_frame(&test_config()));
        while f.connector.next_view().is_some() {}

        let state = f.connector.input_state();
        assert!(state.hands[1].attack.pressed);
        assert!(!state.hands[0].attack.pressed);
        assert!(!state.hands[1].interact.pressed);
        assert!(!state.hands[1].menu.pressed);
        assert_eq!(state.hands[1].attack.value, 0.0);
    }

    #[test]
    fn grip_pose_is_converted_to_engine_coordinates() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        fakexr::set_grip(
            session,
            UserPath::LeftHand,
            openxr::sys::Posef {
                orientation: openxr::sys::Quaternionf {
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                    w: 1.0,
                },
                position: openxr::sys::Vector3f {
                    x: 0.1,
                    y: 1.2,
                    z: 2.0,
                },
            },
        );

        f.run_frame();

        let state = f.connector.input_state();
        let grip = state.hands[0].grip;
        assert!(grip.valid);
        assert_eq!(grip.pose.position.x, 0.1);
        assert_eq!(grip.pose.position.y, 1.2);
        assert_eq!(grip.pose.position.z, -2.0);
        // The other hand was never tracked.
        assert!(!state.hands[1].grip.valid);
        assert!(!state.hands[0].aim.valid);
    }

    #[test]
    fn losing_focus_zeroes_the_snapshot() {
        let mut f = Fixture::ready();
        let session = fakexr::current_session();
        fakexr::set_action_state(session, "attack", ActionState::Bool(true), UserPath::LeftHand);

        f.run_frame();
        assert!(f.connector.input_state().hands[0].attack.pressed);

        fakexr::set_focused(session, false);
        f.run_frame();
        assert_eq!(f.connector.input_state(), Default::default());

        fakexr::set_focused(session, true);
        f.run_frame();
        assert!(f.connector.input_state().hands[0].attack.pressed);
    }

    #[test]
    fn default_bindings_cover_both_profiles() {
        let _f = Fixture::new();
        let instance = fakexr::current_instance();

        let simple = "/interaction_profiles/khr/simple_controller";
        let attack = fakexr::get_suggested_bindings(instance, "attack", simple);
        assert!(attack.contains(&"/user/hand/left/input/select/click".to_string()));
        assert!(attack.contains(&"/user/hand/right/input/select/click".to_string()));
        let interact = fakexr::get_suggested_bindings(instance, "use", simple);
        assert!(interact.contains(&"/user/hand/left/input/menu/click".to_string()));

        let index = "/interaction_profiles/valve/index_controller";
        let attack = fakexr::get_suggested_bindings(instance, "attack", index);
        assert!(attack.contains(&"/user/hand/right/input/trigger/click".to_string()));
        let menu = fakexr::get_suggested_bindings(instance, "menu", index);
        assert!(menu.contains(&"/user/hand/right/input/b/click".to_string()));
        let grip = fakexr::get_suggested_bindings(instance, "grippose", index);
        assert!(grip.contains(&"/user/hand/left/input/grip/pose".to_string()));
    }
}
