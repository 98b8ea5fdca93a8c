//! Executor: turns one proposal into exactly one device primitive.

use std::borrow::Cow;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::types::{
    Action, ActionProposal, ActionResult, Bounds, DeviceState, Direction, DispatchStatus, Point,
    Target, UiElement,
};
use crate::io::driver::{DeviceDriver, DriverError, PrimitiveAction};

const SCROLL_DURATION_MS: u64 = 400;
const MAX_WAIT_MS: u64 = 10_000;

#[derive(Debug)]
pub struct Executor<'d, D: DeviceDriver + ?Sized> {
    driver: &'d D,
    timeout: Duration,
}

impl<'d, D: DeviceDriver + ?Sized> Executor<'d, D> {
    pub fn new(driver: &'d D, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    /// Resolve and dispatch `proposal`, planned on `planned_on`, against `current`.
    ///
    /// The two states differ only when a retry follows a screen change; element
    /// indices are then re-pointed via [`retarget`]. Unresolvable targets and
    /// driver refusals come back as a rejected [`ActionResult`]; only transient
    /// driver errors are returned as `Err`.
    #[instrument(
        skip_all,
        fields(action = proposal.action.name(), planned = planned_on.seq, seq = current.seq)
    )]
    pub fn execute(
        &self,
        proposal: &ActionProposal,
        planned_on: &DeviceState,
        current: &DeviceState,
        timeout: Duration,
    ) -> Result<ActionResult, DriverError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let finish = |dispatch: DispatchStatus| ActionResult {
            dispatch,
            started_at,
            ended_at: Utc::now(),
            latency_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            post_state_seq: None,
        };

        let action = if planned_on.digest == current.digest {
            Ok(Cow::Borrowed(&proposal.action))
        } else {
            retarget(&proposal.action, planned_on, current).map(Cow::Owned)
        };
        let primitive = match action.and_then(|action| resolve(&action, current)) {
            Ok(Some(primitive)) => primitive,
            Ok(None) => return Ok(finish(DispatchStatus::NotDispatched)),
            Err(reason) => {
                warn!(%reason, "action rejected before dispatch");
                return Ok(finish(DispatchStatus::Rejected { reason }));
            }
        };

        match self.driver.dispatch(&primitive, timeout.min(self.timeout)) {
            Ok(_) => {
                let result = finish(DispatchStatus::Dispatched);
                info!(latency_ms = result.latency_ms, "dispatched");
                Ok(result)
            }
            Err(DriverError::Refused(reason)) => {
                warn!(%reason, "driver refused action");
                Ok(finish(DispatchStatus::Rejected { reason }))
            }
            Err(err) => Err(err),
        }
    }
}

/// Re-point an element-index target at the same element on a newer screen.
///
/// An index only names an element on the screen the planner saw. On a changed
/// screen the element is found again by resource id and label, else by label,
/// else by bounds; `Err` when it is gone. Other targets are already logical.
pub fn retarget(
    action: &Action,
    planned_on: &DeviceState,
    current: &DeviceState,
) -> Result<Action, String> {
    match action {
        Action::Tap {
            target: Target::Element { index },
        } => Ok(Action::Tap {
            target: relocate(*index, planned_on, current)?,
        }),
        Action::LongPress {
            target: Target::Element { index },
            duration_ms,
        } => Ok(Action::LongPress {
            target: relocate(*index, planned_on, current)?,
            duration_ms: *duration_ms,
        }),
        other => Ok(other.clone()),
    }
}

fn relocate(
    index: usize,
    planned_on: &DeviceState,
    current: &DeviceState,
) -> Result<Target, String> {
    let pinned = planned_on
        .element(index)
        .ok_or_else(|| format!("element #{index} is not on screen"))?;
    let found = current
        .elements
        .iter()
        .find(|el| same_element(pinned, el))
        .ok_or_else(|| {
            format!(
                "element #{index} \"{}\" is no longer present",
                pinned.label()
            )
        })?;
    if found.index != index {
        info!(from = index, to = found.index, "element moved since planning");
    }
    Ok(Target::Element { index: found.index })
}

fn same_element(pinned: &UiElement, candidate: &UiElement) -> bool {
    if candidate.kind != pinned.kind {
        return false;
    }
    if let Some(id) = pinned.resource_id.as_deref().filter(|id| !id.is_empty()) {
        return candidate.resource_id.as_deref() == Some(id)
            && candidate.label() == pinned.label();
    }
    let label = pinned.label();
    if label.is_empty() {
        candidate.label().is_empty() && candidate.bounds == pinned.bounds
    } else {
        candidate.label() == label
    }
}

/// Map a logical action to a primitive in screen coordinates.
///
/// `Ok(None)` for declarations, which are never dispatched; `Err` carries the
/// rejection reason.
pub fn resolve(action: &Action, state: &DeviceState) -> Result<Option<PrimitiveAction>, String> {
    let primitive = match action {
        Action::DeclareDone { .. } | Action::DeclareStuck { .. } => return Ok(None),
        Action::Tap { target } => PrimitiveAction::Tap {
            at: resolve_target(target, state)?,
        },
        Action::LongPress {
            target,
            duration_ms,
        } => PrimitiveAction::LongPress {
            at: resolve_target(target, state)?,
            duration_ms: *duration_ms,
        },
        Action::Swipe {
            from,
            to,
            duration_ms,
        } => {
            ensure_on_screen(*from, state)?;
            ensure_on_screen(*to, state)?;
            PrimitiveAction::Swipe {
                from: *from,
                to: *to,
                duration_ms: *duration_ms,
            }
        }
        Action::Scroll { direction } => scroll_swipe(*direction, state)?,
        Action::TypeText { text } => {
            if text.is_empty() {
                return Err("type_text with empty text".to_string());
            }
            PrimitiveAction::InputText { text: text.clone() }
        }
        Action::PressKey { key } => PrimitiveAction::Key { key: *key },
        Action::LaunchApp { package } => {
            let package = package.trim();
            if package.is_empty() || package.contains(char::is_whitespace) {
                return Err(format!("invalid package name \"{package}\""));
            }
            PrimitiveAction::LaunchApp {
                package: package.to_string(),
            }
        }
        Action::Wait { duration_ms } => PrimitiveAction::Wait {
            duration_ms: (*duration_ms).min(MAX_WAIT_MS),
        },
    };
    Ok(Some(primitive))
}

fn resolve_target(target: &Target, state: &DeviceState) -> Result<Point, String> {
    let element = match target {
        Target::Coordinates { x, y } => {
            let point = Point { x: *x, y: *y };
            ensure_on_screen(point, state)?;
            return Ok(point);
        }
        Target::Element { index } => state
            .element(*index)
            .ok_or_else(|| format!("element #{index} is not on screen"))?,
        Target::Text { text } => state
            .find_by_text(text)
            .ok_or_else(|| format!("no element labelled \"{text}\""))?,
        Target::ResourceId { id } => state
            .find_by_resource_id(id)
            .ok_or_else(|| format!("no element with id {id}"))?,
    };
    if !element.enabled {
        return Err(format!("element {target} is disabled"));
    }
    if !element.visible || element.bounds.is_empty() {
        return Err(format!("element {target} is not visible"));
    }
    Ok(element.bounds.center())
}

fn ensure_on_screen(point: Point, state: &DeviceState) -> Result<(), String> {
    if point.x < 0 || point.y < 0 {
        return Err(format!("point ({},{}) is off screen", point.x, point.y));
    }
    if let Some(screen) = state.screen
        && (point.x >= screen.width || point.y >= screen.height)
    {
        return Err(format!(
            "point ({},{}) is outside the {}x{} screen",
            point.x, point.y, screen.width, screen.height
        ));
    }
    Ok(())
}

/// Scrolling `Down` reveals content below, so the finger moves upwards.
fn scroll_swipe(direction: Direction, state: &DeviceState) -> Result<PrimitiveAction, String> {
    let area = scroll_area(state).ok_or_else(|| "no scrollable area known".to_string())?;
    let center = area.center();
    let dx = area.width() * 3 / 10;
    let dy = area.height() * 3 / 10;
    let (from, to) = match direction {
        Direction::Down => ((center.x, center.y + dy), (center.x, center.y - dy)),
        Direction::Up => ((center.x, center.y - dy), (center.x, center.y + dy)),
        Direction::Right => ((center.x + dx, center.y), (center.x - dx, center.y)),
        Direction::Left => ((center.x - dx, center.y), (center.x + dx, center.y)),
    };
    Ok(PrimitiveAction::Swipe {
        from: Point {
            x: from.0,
            y: from.1,
        },
        to: Point { x: to.0, y: to.1 },
        duration_ms: SCROLL_DURATION_MS,
    })
}

/// First visible scrollable element, else the screen, else the union of all elements.
fn scroll_area(state: &DeviceState) -> Option<Bounds> {
    if let Some(el) = state
        .elements
        .iter()
        .find(|el| el.scrollable && el.visible && !el.bounds.is_empty())
    {
        return Some(el.bounds);
    }
    if let Some(screen) = state.screen {
        return Some(Bounds::new(0, 0, screen.width, screen.height));
    }
    state
        .elements
        .iter()
        .map(|el| el.bounds)
        .filter(|b| !b.is_empty())
        .reduce(|a, b| {
            Bounds::new(
                a.left.min(b.left),
                a.top.min(b.top),
                a.right.max(b.right),
                a.bottom.max(b.bottom),
            )
        })
}
