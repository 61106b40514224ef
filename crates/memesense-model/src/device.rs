//! Device selection: CUDA > Metal > CPU fallback.

use candle_core::Device;
use memesense_core::config::DevicePreference;

/// Select the compute device for a run.
///
/// [`DevicePreference::Cpu`] always yields the CPU. With
/// [`DevicePreference::Auto`], CUDA is tried first (when compiled with the
/// `cuda` feature), then Metal (with `metal`), then the CPU.
pub fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        tracing::info!("CPU requested by configuration");
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            tracing::info!("Using CUDA device 0");
            return device;
        }
        tracing::warn!("CUDA feature enabled but no GPU available, falling back");
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device 0");
            return device;
        }
        tracing::warn!("Metal feature enabled but no device available, falling back");
    }

    tracing::info!("No accelerator available, using CPU");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_is_honoured() {
        assert!(matches!(select_device(DevicePreference::Cpu), Device::Cpu));
    }

    #[test]
    fn test_auto_without_accelerator_features_is_cpu() {
        if cfg!(not(any(feature = "cuda", feature = "metal"))) {
            assert!(matches!(select_device(DevicePreference::Auto), Device::Cpu));
        }
    }
}
