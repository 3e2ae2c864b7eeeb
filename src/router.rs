//! Routes events from the server to the flasher whose rule matches the window.
//!
//! One flasher exists per configured rule, plus a default flasher built from
//! the global options. Rules are checked in declaration order and the default
//! rule, appended last, matches everything, so a lookup always succeeds.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::config::{Config, FlashConfig, FlashLoneWindows, RuleConfig};
use crate::display::{DisplayResult, DisplayServer, Event, EventKind, Window};
use crate::flasher::{Flasher, OpacityWriter};

/// Match criteria plus the suppression options of one rule.
pub struct Rule {
    criteria: Vec<(&'static str, Regex)>,
    flash_on_focus: bool,
    flash_lone_windows: FlashLoneWindows,
    flash_fullscreen: bool,
}

impl Rule {
    fn from_config(config: &RuleConfig) -> Result<Self> {
        let criteria = config
            .criteria
            .entries()
            .into_iter()
            .map(|(name, pattern)| {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("invalid {name} regex {pattern:?}"))?;
                Ok((name, regex))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            criteria,
            flash_on_focus: config.flash.flash_on_focus,
            flash_lone_windows: config.flash.flash_lone_windows,
            flash_fullscreen: config.flash.flash_fullscreen,
        })
    }

    /// The wildcard rule appended after all configured rules.
    fn wildcard(defaults: &FlashConfig) -> Self {
        Self {
            criteria: Vec::new(),
            flash_on_focus: defaults.flash_on_focus,
            flash_lone_windows: defaults.flash_lone_windows,
            flash_fullscreen: defaults.flash_fullscreen,
        }
    }

    /// A window matches when every criterion whose property the window
    /// carries matches at the start of the property value. A rule with no
    /// criteria matches everything; a criterion over a property the window
    /// does not have is skipped (some WMs report a window id but no class).
    pub fn matches(&self, window: &Window) -> bool {
        self.criteria.iter().all(|(name, regex)| {
            match window.property(name) {
                Some(value) => regex.find(value).is_some_and(|m| m.start() == 0),
                None => true,
            }
        })
    }
}

/// Single-threaded consumer of the event queue.
pub struct FlashRouter {
    display: Arc<dyn DisplayServer>,
    /// Ordered (rule, flasher) pairs; the last entry is always the wildcard
    /// default.
    rules: Vec<(Rule, Flasher)>,
    /// Workspaces are only queried when some rule needs lone-window tracking.
    track_workspaces: bool,
    /// Previously focused window, for suppressing consecutive flashes of the
    /// same window. Without this guard closing a window in i3 flashes the
    /// next window several times.
    prev_focus: Option<u64>,
    current_workspace: Option<u32>,
    prev_workspace: Option<u32>,
}

impl FlashRouter {
    pub fn new(
        config: &Config,
        display: Arc<dyn DisplayServer>,
        writer: OpacityWriter,
    ) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len() + 1);
        let mut track_workspaces = config.defaults.flash_lone_windows != FlashLoneWindows::Always;
        for rule_config in &config.rules {
            if rule_config.flash.flash_lone_windows != FlashLoneWindows::Always {
                track_workspaces = true;
            }
            rules.push((
                Rule::from_config(rule_config)?,
                Flasher::new(&rule_config.flash, Arc::clone(&display), writer.clone()),
            ));
        }
        rules.push((
            Rule::wildcard(&config.defaults),
            Flasher::new(&config.defaults, Arc::clone(&display), writer.clone()),
        ));

        let current_workspace = if track_workspaces {
            display
                .focused_workspace()
                .map_err(|err| anyhow::anyhow!("failed to query focused workspace: {err}"))?
        } else {
            None
        };
        Ok(Self {
            display,
            rules,
            track_workspaces,
            prev_focus: None,
            current_workspace,
            prev_workspace: None,
        })
    }

    /// Handle one event. A `WindowGone` error means the event's window
    /// vanished underneath us; callers drop the event.
    pub fn route(&mut self, event: &Event) -> DisplayResult<()> {
        match event.kind {
            EventKind::WindowInit => self.route_window_init(&event.window),
            EventKind::NewWindow => self.route_new_window(&event.window),
            EventKind::FocusShift => self.route_focus_shift(&event.window),
            EventKind::ClientRequest => self.route_client_request(&event.window),
        }
    }

    fn route_window_init(&mut self, window: &Window) -> DisplayResult<()> {
        let (_, flasher) = self.matched(window);
        flasher.set_default_opacity(window);
        Ok(())
    }

    fn route_new_window(&mut self, window: &Window) -> DisplayResult<()> {
        if self.config_allows_flash(window)? {
            let (_, flasher) = self.matched(window);
            flasher.flash(window);
            // The window's first focus-shift usually races the map event.
            // Recording it here coalesces the two into a single flash.
            self.prev_focus = Some(window.id);
        } else {
            let (_, flasher) = self.matched(window);
            flasher.set_default_opacity(window);
        }
        Ok(())
    }

    fn route_focus_shift(&mut self, window: &Window) -> DisplayResult<()> {
        if self.prev_focus == Some(window.id) {
            debug!(window = window.id, "window was just flashed, ignoring");
            return Ok(());
        }
        self.prev_focus = Some(window.id);
        if self.config_allows_flash(window)? {
            let (_, flasher) = self.matched(window);
            flasher.flash(window);
        } else {
            let (_, flasher) = self.matched(window);
            flasher.set_default_opacity(window);
        }
        Ok(())
    }

    fn route_client_request(&mut self, window: &Window) -> DisplayResult<()> {
        // Manual requests bypass deduplication and all suppression checks
        let (_, flasher) = self.matched(window);
        flasher.flash(window);
        Ok(())
    }

    /// First matching (rule, flasher) pair; the wildcard default guarantees a
    /// result.
    fn matched(&self, window: &Window) -> &(Rule, Flasher) {
        let last = self.rules.len() - 1;
        for (i, pair) in self.rules[..last].iter().enumerate() {
            if pair.0.matches(window) {
                debug!(window = window.id, rule = i, "window matches rule criteria");
                return pair;
            }
        }
        &self.rules[last]
    }

    /// Apply the suppression conditions of the window's rule.
    fn config_allows_flash(&mut self, window: &Window) -> DisplayResult<bool> {
        if self.track_workspaces {
            self.prev_workspace = self.current_workspace;
            self.current_workspace = self.display.focused_workspace()?;
        }
        let rule = &self.matched(window).0;

        if !rule.flash_on_focus {
            debug!(window = window.id, "flash_on_focus disabled, ignoring");
            return Ok(false);
        }

        if rule.flash_lone_windows != FlashLoneWindows::Always
            && self
                .display
                .list_mapped_windows(self.current_workspace)?
                .len()
                < 2
        {
            let switched = self.current_workspace != self.prev_workspace;
            let deny = match rule.flash_lone_windows {
                FlashLoneWindows::Never => true,
                FlashLoneWindows::OnOpenClose => switched,
                FlashLoneWindows::OnSwitch => !switched,
                FlashLoneWindows::Always => false,
            };
            if deny {
                debug!("current workspace has fewer than 2 windows, ignoring");
                return Ok(false);
            }
        }

        if !rule.flash_fullscreen && self.display.is_fullscreen(window.id)? {
            debug!(window = window.id, "window is fullscreen, ignoring");
            return Ok(false);
        }

        Ok(true)
    }

    /// Restore every mapped window to its matched rule's default opacity.
    /// Used at shutdown so no window is left transparent.
    pub fn reset_all_to_default(&self) -> DisplayResult<()> {
        for window in self.display.list_mapped_windows(None)? {
            let (_, flasher) = self.matched(&window);
            if let Err(err) = self.display.set_opacity(window.id, flasher.default_opacity()) {
                debug!(window = window.id, %err, "could not reset window opacity");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CriteriaConfig;
    use crate::display::fake::{FakeDisplay, window};
    use std::thread;
    use std::time::Duration;

    fn rule(criteria: CriteriaConfig, flash: FlashConfig) -> RuleConfig {
        RuleConfig { criteria, flash }
    }

    fn quick_flash() -> FlashConfig {
        FlashConfig {
            time: 40.0,
            ntimepoints: 2,
            ..FlashConfig::default()
        }
    }

    struct Fixture {
        display: Arc<FakeDisplay>,
        router: FlashRouter,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            let display = Arc::new(FakeDisplay::new());
            display.set_workspace(Some(0));
            let dynamic: Arc<dyn DisplayServer> = Arc::clone(&display) as Arc<dyn DisplayServer>;
            let writer = OpacityWriter::spawn(Arc::clone(&dynamic)).unwrap();
            let router = FlashRouter::new(&config, dynamic, writer).unwrap();
            Self { display, router }
        }

        fn flash_count(&self, id: u64) -> usize {
            // A flash always begins with a write of the flash opacity
            self.display
                .opacity_writes()
                .iter()
                .filter(|(w, o)| *w == id && *o == 0.8)
                .count()
        }

        fn settle(&self) {
            thread::sleep(Duration::from_millis(150));
        }
    }

    fn event(window: Window, kind: EventKind) -> Event {
        Event { window, kind }
    }

    #[test]
    fn first_matching_rule_wins() {
        let config = Config {
            defaults: quick_flash(),
            rules: vec![
                rule(
                    CriteriaConfig {
                        window_class: Some("Foo".to_string()),
                        ..Default::default()
                    },
                    FlashConfig {
                        default_opacity: 0.6,
                        ..quick_flash()
                    },
                ),
                rule(
                    CriteriaConfig {
                        window_id: Some("bar".to_string()),
                        ..Default::default()
                    },
                    FlashConfig {
                        default_opacity: 0.7,
                        ..quick_flash()
                    },
                ),
            ],
        };
        let mut fixture = Fixture::new(config);
        // Matches both rule 0 (class Foo) and rule 1 (id bar): rule 0 wins
        let win = window(1, "bar", "Foo");
        fixture.display.add_window(win.clone(), 0);

        fixture
            .router
            .route(&event(win, EventKind::WindowInit))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.display.opacity_writes(), vec![(1, 0.6)]);
    }

    #[test]
    fn unmatched_window_falls_through_to_the_default_rule() {
        let config = Config {
            defaults: FlashConfig {
                default_opacity: 0.9,
                ..quick_flash()
            },
            rules: vec![rule(
                CriteriaConfig {
                    window_class: Some("Foo".to_string()),
                    ..Default::default()
                },
                FlashConfig {
                    default_opacity: 0.5,
                    ..quick_flash()
                },
            )],
        };
        let mut fixture = Fixture::new(config);
        let win = window(2, "other", "Other");
        fixture.display.add_window(win.clone(), 0);

        fixture
            .router
            .route(&event(win, EventKind::WindowInit))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.display.opacity_writes(), vec![(2, 0.9)]);
    }

    #[test]
    fn rule_matching_anchors_at_the_start() {
        let config = Config {
            defaults: quick_flash(),
            rules: vec![rule(
                CriteriaConfig {
                    window_class: Some("term".to_string()),
                    ..Default::default()
                },
                FlashConfig {
                    default_opacity: 0.5,
                    ..quick_flash()
                },
            )],
        };
        let mut fixture = Fixture::new(config);
        // "xterm" contains "term" but not at the start: default rule applies
        let win = window(3, "xterm", "xterm");
        fixture.display.add_window(win.clone(), 0);

        fixture
            .router
            .route(&event(win, EventKind::WindowInit))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.display.opacity_writes(), vec![(3, 1.0)]);
    }

    #[test]
    fn consecutive_focus_shifts_for_one_window_flash_once() {
        let mut fixture = Fixture::new(Config {
            defaults: quick_flash(),
            rules: vec![],
        });
        let a = window(1, "a", "A");
        let b = window(2, "b", "B");
        fixture.display.add_window(a.clone(), 0);
        fixture.display.add_window(b.clone(), 0);

        for win in [&b, &b, &a, &b] {
            fixture
                .router
                .route(&event(win.clone(), EventKind::FocusShift))
                .unwrap();
            fixture.settle();
        }
        // b, b, a, b: the duplicate b is dropped
        assert_eq!(fixture.flash_count(2), 2);
        assert_eq!(fixture.flash_count(1), 1);
    }

    #[test]
    fn client_requests_are_never_deduplicated_or_suppressed() {
        let mut fixture = Fixture::new(Config {
            defaults: FlashConfig {
                flash_on_focus: false,
                ..quick_flash()
            },
            rules: vec![],
        });
        let win = window(1, "a", "A");
        fixture.display.add_window(win.clone(), 0);

        fixture
            .router
            .route(&event(win.clone(), EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        // flash_on_focus is off: the shift restored default opacity instead
        assert_eq!(fixture.flash_count(1), 0);

        fixture
            .router
            .route(&event(win.clone(), EventKind::ClientRequest))
            .unwrap();
        fixture.settle();
        fixture
            .router
            .route(&event(win, EventKind::ClientRequest))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 2);
    }

    #[test]
    fn lone_window_never_suppresses_until_a_second_window_appears() {
        let mut fixture = Fixture::new(Config {
            defaults: FlashConfig {
                flash_lone_windows: FlashLoneWindows::Never,
                ..quick_flash()
            },
            rules: vec![],
        });
        let a = window(1, "a", "A");
        fixture.display.add_window(a.clone(), 0);

        fixture
            .router
            .route(&event(a.clone(), EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 0);

        let b = window(2, "b", "B");
        fixture.display.add_window(b.clone(), 0);
        fixture
            .router
            .route(&event(b, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(2), 1);
    }

    #[test]
    fn lone_window_on_switch_only_flashes_after_a_workspace_change() {
        let mut fixture = Fixture::new(Config {
            defaults: FlashConfig {
                flash_lone_windows: FlashLoneWindows::OnSwitch,
                ..quick_flash()
            },
            rules: vec![],
        });
        let a = window(1, "a", "A");
        let b = window(2, "b", "B");
        fixture.display.add_window(a.clone(), 0);
        fixture.display.add_window(b.clone(), 1);

        // Same workspace as before: suppressed
        fixture
            .router
            .route(&event(a, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 0);

        // Workspace switch to a lone window: flashes
        fixture.display.set_workspace(Some(1));
        fixture
            .router
            .route(&event(b, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(2), 1);
    }

    #[test]
    fn lone_window_on_open_close_suppresses_after_a_workspace_change() {
        let mut fixture = Fixture::new(Config {
            defaults: FlashConfig {
                flash_lone_windows: FlashLoneWindows::OnOpenClose,
                ..quick_flash()
            },
            rules: vec![],
        });
        let a = window(1, "a", "A");
        let b = window(2, "b", "B");
        fixture.display.add_window(a.clone(), 0);
        fixture.display.add_window(b.clone(), 1);

        // No workspace change (open/close on the same workspace): flashes
        fixture
            .router
            .route(&event(a, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 1);

        // Workspace switch: suppressed
        fixture.display.set_workspace(Some(1));
        fixture
            .router
            .route(&event(b, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(2), 0);
    }

    #[test]
    fn fullscreen_windows_are_not_flashed_unless_allowed() {
        let mut fixture = Fixture::new(Config {
            defaults: FlashConfig {
                flash_fullscreen: false,
                ..quick_flash()
            },
            rules: vec![],
        });
        let a = window(1, "a", "A");
        let b = window(2, "b", "B");
        fixture.display.add_window(a.clone(), 0);
        fixture.display.add_window(b.clone(), 0);
        fixture.display.set_fullscreen(1, true);

        fixture
            .router
            .route(&event(a, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 0);

        fixture
            .router
            .route(&event(b, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(2), 1);
    }

    #[test]
    fn new_window_flash_coalesces_with_its_first_focus_shift() {
        let mut fixture = Fixture::new(Config {
            defaults: quick_flash(),
            rules: vec![],
        });
        let win = window(1, "a", "A");
        let other = window(2, "b", "B");
        fixture.display.add_window(win.clone(), 0);
        fixture.display.add_window(other, 0);

        fixture
            .router
            .route(&event(win.clone(), EventKind::NewWindow))
            .unwrap();
        fixture.settle();
        fixture
            .router
            .route(&event(win, EventKind::FocusShift))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.flash_count(1), 1);
    }

    #[test]
    fn window_init_never_animates() {
        let mut fixture = Fixture::new(Config {
            defaults: quick_flash(),
            rules: vec![],
        });
        let win = window(1, "a", "A");
        fixture.display.add_window(win.clone(), 0);

        fixture
            .router
            .route(&event(win, EventKind::WindowInit))
            .unwrap();
        fixture.settle();
        assert_eq!(fixture.display.opacity_writes(), vec![(1, 1.0)]);
    }

    #[test]
    fn reset_all_restores_each_window_to_its_rule_default() {
        let config = Config {
            defaults: quick_flash(),
            rules: vec![rule(
                CriteriaConfig {
                    window_class: Some("Dim".to_string()),
                    ..Default::default()
                },
                FlashConfig {
                    default_opacity: 0.4,
                    ..quick_flash()
                },
            )],
        };
        let fixture = Fixture::new(config);
        fixture.display.add_window(window(1, "dim", "Dim"), 0);
        fixture.display.add_window(window(2, "b", "B"), 0);

        fixture.router.reset_all_to_default().unwrap();
        let mut writes = fixture.display.opacity_writes();
        writes.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(writes, vec![(1, 0.4), (2, 1.0)]);
    }
}
