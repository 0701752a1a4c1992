// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use skylight_render::ResizeEvent;
use winit::dpi::PhysicalSize;

/// Typed resize notification for the engine, built from the window's physical size.
pub fn resize_event(size: PhysicalSize<u32>) -> ResizeEvent {
    ResizeEvent::new(size.width, size.height)
}
