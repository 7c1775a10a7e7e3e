pub mod biot_savart;
pub mod edge;
pub mod error;
pub mod record;
pub mod settings;
/// The `wake_core` crate models the trailing wake shed from lifting surfaces
/// and rotor blades as relaxed vortex filaments.
///
/// Key components:
/// - **Trails**: `VortexTrail` filaments with a binary edge hierarchy for fast far-field
///   Biot-Savart sums.
/// - **Sheets**: `VortexSheet` agglomerates neighbouring trails span-wise and owns the
///   relaxation drivers.
/// - **Traits**: `InducedVelocityField` and `WakeLinearOperator`, the seams to an outer
///   panel solver.
/// - **Records**: fixed little-endian wake-shape records for restart files.
pub mod sheet;
pub mod smoothing;
pub mod trail;
pub mod traits;
pub mod wake_loop;
