//! One-pole low-pass filter exposing the worklet processing ABI.
//!
//! Build with:
//!
//! ```text
//! cargo build --release --target wasm32-unknown-unknown
//! ```
//!
//! and run it with `worklet run target/wasm32-unknown-unknown/release/worklet_test_module.wasm`.

use std::alloc::{alloc as std_alloc, dealloc as std_dealloc, Layout};
use std::cell::RefCell;
use std::f32::consts::PI;

// =============================================================================
// Host Imports
// =============================================================================

#[link(wasm_import_module = "worklet")]
extern "C" {
    /// Send raw bytes to the host's diagnostic channel.
    #[link_name = "log"]
    fn worklet_log(level: i32, ptr: *const u8, len: i32);
}

const LOG_INFO: i32 = 2;

/// Cutoff frequency of the filter in Hz
const CUTOFF_HZ: f32 = 1_000.0;

/// Status codes returned to the host
const OK: i32 = 0;
const ERR_CONFIG: i32 = 1;
const ERR_NOT_INITIALIZED: i32 = 2;

struct Filter {
    coefficient: f32,
    channels: usize,
    frames: usize,
    /// Last output per channel
    state: Vec<f32>,
}

thread_local! {
    static FILTER: RefCell<Option<Filter>> = const { RefCell::new(None) };
}

fn host_log(level: i32, message: &str) {
    unsafe { worklet_log(level, message.as_ptr(), message.len() as i32) };
}

/// Allocate memory for host to write into. Returns 0 on failure.
#[no_mangle]
pub extern "C" fn alloc(size: i32) -> i32 {
    match Layout::from_size_align(size.max(1) as usize, 8) {
        Ok(layout) => unsafe { std_alloc(layout) as i32 },
        Err(_) => 0,
    }
}

/// Free previously allocated memory.
#[no_mangle]
pub extern "C" fn dealloc(ptr: i32, size: i32) {
    if let Ok(layout) = Layout::from_size_align(size.max(1) as usize, 8) {
        unsafe { std_dealloc(ptr as *mut u8, layout) };
    }
}

/// Set up the filter for the session's format.
#[no_mangle]
pub extern "C" fn init(sample_rate: i32, channels: i32, frames: i32) -> i32 {
    if sample_rate <= 0 || channels <= 0 || frames <= 0 {
        return ERR_CONFIG;
    }

    let dt = 1.0 / sample_rate as f32;
    let rc = 1.0 / (2.0 * PI * CUTOFF_HZ);
    let coefficient = dt / (rc + dt);

    FILTER.with(|filter| {
        *filter.borrow_mut() = Some(Filter {
            coefficient,
            channels: channels as usize,
            frames: frames as usize,
            state: vec![0.0; channels as usize],
        });
    });

    host_log(LOG_INFO, "low-pass ready");
    OK
}

/// Filter one planar block.
#[no_mangle]
pub extern "C" fn process(in_ptr: i32, out_ptr: i32, frames: i32, channels: i32) -> i32 {
    FILTER.with(|filter| {
        let mut filter = filter.borrow_mut();
        let Some(filter) = filter.as_mut() else {
            return ERR_NOT_INITIALIZED;
        };
        if frames as usize != filter.frames || channels as usize != filter.channels {
            return ERR_CONFIG;
        }

        let len = filter.frames * filter.channels;
        let input = unsafe { std::slice::from_raw_parts(in_ptr as *const f32, len) };
        let output = unsafe { std::slice::from_raw_parts_mut(out_ptr as *mut f32, len) };

        for channel in 0..filter.channels {
            let range = channel * filter.frames..(channel + 1) * filter.frames;
            let mut y = filter.state[channel];
            for (out, &x) in output[range.clone()].iter_mut().zip(&input[range]) {
                y += filter.coefficient * (x - y);
                *out = y;
            }
            filter.state[channel] = y;
        }

        OK
    })
}
