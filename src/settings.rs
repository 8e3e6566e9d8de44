use std::path::PathBuf;

/// Which compute device the segmentation model should run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA if the loaded ONNX Runtime build provides it, otherwise CPU.
    Auto,
    Cpu,
    /// CUDA or nothing: the model is reported unavailable without it.
    Cuda,
}

impl DevicePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "cpu" => DevicePreference::Cpu,
            "cuda" | "gpu" => DevicePreference::Cuda,
            _ => DevicePreference::Auto,
        }
    }

    pub fn all() -> &'static [DevicePreference] {
        &[DevicePreference::Auto, DevicePreference::Cpu, DevicePreference::Cuda]
    }
}

/// Application settings that persist across sessions
#[derive(Clone, Debug, PartialEq)]
pub struct AppSettings {
    /// Path to onnxruntime.dll / libonnxruntime.so / libonnxruntime.dylib
    pub onnx_runtime_path: String,
    /// Segment-Anything image encoder (.onnx)
    pub encoder_model_path: String,
    /// Segment-Anything prompt/mask decoder (.onnx)
    pub decoder_model_path: String,
    pub device: DevicePreference,
    /// Ask the decoder for several candidate masks and keep the best-scoring one.
    pub multimask: bool,
    /// Logit cut-off applied to decoder masks (0.0 = SAM default).
    pub mask_threshold: f32,
    /// Directory the upload dialog opens in.
    pub last_open_dir: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            onnx_runtime_path: String::new(),
            encoder_model_path: String::new(),
            decoder_model_path: String::new(),
            device: DevicePreference::Auto,
            multimask: true,
            mask_threshold: 0.0,
            last_open_dir: String::new(),
        }
    }
}

impl AppSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/segmentfe/segmentfe_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\SegmentFE\segmentfe_settings.cfg
    /// On macOS:   ~/Library/Application Support/SegmentFE/segmentfe_settings.cfg
    /// Fallback:   same directory as the executable.
    pub(crate) fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("segmentfe");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("segmentfe_settings.cfg"));
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA")
                .or_else(|_| std::env::var("USERPROFILE"))
                .unwrap_or_default();
            let config_dir = PathBuf::from(appdata).join("SegmentFE");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("segmentfe_settings.cfg"));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
            let config_dir = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("SegmentFE");
            let _ = std::fs::create_dir_all(&config_dir);
            return Some(config_dir.join("segmentfe_settings.cfg"));
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.join("segmentfe_settings.cfg")))
        }
    }

    /// True when all three files needed by the model are configured.
    pub fn model_configured(&self) -> bool {
        !self.onnx_runtime_path.is_empty()
            && !self.encoder_model_path.is_empty()
            && !self.decoder_model_path.is_empty()
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "onnx_runtime_path={}\n\
             encoder_model_path={}\n\
             decoder_model_path={}\n\
             device={}\n\
             multimask={}\n\
             mask_threshold={}\n\
             last_open_dir={}\n",
            self.onnx_runtime_path,
            self.encoder_model_path,
            self.decoder_model_path,
            self.device.as_str(),
            self.multimask,
            self.mask_threshold,
            self.last_open_dir,
        )
    }

    /// Parse `key=value` lines; unknown keys are ignored, bad values keep the default.
    pub fn from_config_str(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "onnx_runtime_path" => s.onnx_runtime_path = val.to_string(),
                "encoder_model_path" => s.encoder_model_path = val.to_string(),
                "decoder_model_path" => s.decoder_model_path = val.to_string(),
                "device" => s.device = DevicePreference::parse(val),
                "multimask" => s.multimask = val != "false",
                "mask_threshold" => {
                    s.mask_threshold = val
                        .parse::<f32>()
                        .ok()
                        .filter(|t| t.is_finite())
                        .unwrap_or(0.0);
                }
                "last_open_dir" => s.last_open_dir = val.to_string(),
                _ => {}
            }
        }
        s
    }

    /// Save settings to disk
    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = std::fs::write(&path, self.to_config_string()) {
            crate::log_warn!("Could not save settings to {}: {}", path.display(), e);
        }
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else { return Self::default() };
        let Ok(content) = std::fs::read_to_string(&path) else { return Self::default() };
        Self::from_config_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_string_survives_reload() {
        let settings = AppSettings {
            onnx_runtime_path: "/opt/ort/lib/libonnxruntime.so".into(),
            encoder_model_path: "/models/sam_vit_h_encoder.onnx".into(),
            decoder_model_path: "/models/sam_vit_h_decoder.onnx".into(),
            device: DevicePreference::Cpu,
            multimask: false,
            mask_threshold: 0.5,
            last_open_dir: "/home/me/pictures".into(),
        };
        assert_eq!(AppSettings::from_config_str(&settings.to_config_string()), settings);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let s = AppSettings::from_config_str(
            "device=tpu\nmask_threshold=abc\nno equals sign\nunknown_key=1\n",
        );
        assert_eq!(s.device, DevicePreference::Auto);
        assert_eq!(s.mask_threshold, 0.0);
        assert!(s.multimask);
    }

    #[test]
    fn model_needs_all_three_paths() {
        let mut s = AppSettings::default();
        assert!(!s.model_configured());
        s.onnx_runtime_path = "ort.dll".into();
        s.encoder_model_path = "enc.onnx".into();
        assert!(!s.model_configured());
        s.decoder_model_path = "dec.onnx".into();
        assert!(s.model_configured());
    }

    #[test]
    fn device_parse_accepts_gpu_alias() {
        assert_eq!(DevicePreference::parse("GPU"), DevicePreference::Cuda);
        assert_eq!(DevicePreference::parse(" cpu "), DevicePreference::Cpu);
    }
}
