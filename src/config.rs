use crate::core::gfx::{BackendType, GfxOptions};
use log::{LevelFilter, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

const CONFIG_PATH: &str = "cubegfx.ini";
const SECTION: &str = "Options";

// --- Minimal INI reader ---
#[derive(Debug, Default)]
pub struct SimpleIni {
    sections: HashMap<String, HashMap<String, String>>,
}

impl SimpleIni {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content);
        Ok(())
    }

    /// Replaces the current contents with `content`. Comment lines start
    /// with `;` or `#`; keys before the first section header land in "".
    pub fn parse(&mut self, content: &str) {
        self.sections.clear();
        let mut current = String::new();

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                self.sections.entry(current.clone()).or_default();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            self.sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value.trim().to_string());
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(SECTION, key).and_then(|v| v.parse::<T>().ok())
    }

    /// `0` is false, any other integer is true.
    fn flag(&self, key: &str) -> Option<bool> {
        self.parsed::<u8>(key).map(|v| v != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Error => "Error",
            Self::Warn => "Warn",
            Self::Info => "Info",
            Self::Debug => "Debug",
            Self::Trace => "Trace",
        }
    }

    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub video_renderer: BackendType,
    pub vsync: bool,
    /// 0 = unlimited.
    pub max_fps: u32,
    pub mipmaps: bool,
    pub managed_textures: bool,
    pub gfx_debug: bool,
    pub display_width: u32,
    pub display_height: u32,
    /// Vertical field of view in degrees.
    pub fov: f32,
    /// Software renderer video memory budget; 0 = unlimited.
    pub software_vram_mb: u32,
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_renderer: BackendType::Wgpu,
            vsync: true,
            max_fps: 0,
            mipmaps: true,
            managed_textures: true,
            gfx_debug: false,
            display_width: 854,
            display_height: 480,
            fov: 70.0,
            software_vram_mb: 0,
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Reads `[Options]`, keeping the default for every missing or malformed key.
    pub fn from_ini(ini: &SimpleIni) -> Self {
        let default = Self::default();
        Self {
            video_renderer: ini
                .parsed::<BackendType>("VideoRenderer")
                .unwrap_or(default.video_renderer),
            vsync: ini.flag("Vsync").unwrap_or(default.vsync),
            max_fps: ini.parsed("MaxFps").unwrap_or(default.max_fps),
            mipmaps: ini.flag("Mipmaps").unwrap_or(default.mipmaps),
            managed_textures: ini
                .flag("ManagedTextures")
                .unwrap_or(default.managed_textures),
            gfx_debug: ini.flag("GfxDebug").unwrap_or(default.gfx_debug),
            display_width: ini
                .parsed::<u32>("DisplayWidth")
                .filter(|&w| w > 0)
                .unwrap_or(default.display_width),
            display_height: ini
                .parsed::<u32>("DisplayHeight")
                .filter(|&h| h > 0)
                .unwrap_or(default.display_height),
            fov: ini
                .parsed::<f32>("Fov")
                .filter(|f| (1.0..=179.0).contains(f))
                .unwrap_or(default.fov),
            software_vram_mb: ini
                .parsed("SoftwareVramMb")
                .unwrap_or(default.software_vram_mb),
            log_level: ini.parsed("LogLevel").unwrap_or(default.log_level),
        }
    }

    /// Minimum frame time for the configured frame cap; 0 disables it.
    pub fn min_frame_ms(&self) -> f32 {
        if self.max_fps == 0 {
            0.0
        } else {
            1000.0 / self.max_fps as f32
        }
    }

    pub fn to_gfx_options(&self) -> GfxOptions {
        GfxOptions {
            width: self.display_width,
            height: self.display_height,
            vsync: self.vsync,
            min_frame_ms: self.min_frame_ms(),
            mipmaps: self.mipmaps,
            managed_textures: self.managed_textures,
            gfx_debug: self.gfx_debug,
            vram_budget: (self.software_vram_mb > 0)
                .then(|| self.software_vram_mb as usize * 1024 * 1024),
        }
    }

    fn to_ini_string(&self) -> String {
        let flag = |b: bool| if b { "1" } else { "0" };
        let renderer = match self.video_renderer {
            BackendType::Software => "software",
            BackendType::Wgpu => "wgpu",
            BackendType::VulkanWgpu => "wgpu-vulkan",
            BackendType::OpenGLWgpu => "wgpu-opengl",
            #[cfg(target_os = "windows")]
            BackendType::DirectX => "wgpu-dx12",
        };

        // Keys in alphabetical order.
        let mut content = String::new();
        content.push_str("[Options]\n");
        content.push_str(&format!("DisplayHeight={}\n", self.display_height));
        content.push_str(&format!("DisplayWidth={}\n", self.display_width));
        content.push_str(&format!("Fov={}\n", self.fov));
        content.push_str(&format!("GfxDebug={}\n", flag(self.gfx_debug)));
        content.push_str(&format!("LogLevel={}\n", self.log_level.as_str()));
        content.push_str(&format!("ManagedTextures={}\n", flag(self.managed_textures)));
        content.push_str(&format!("MaxFps={}\n", self.max_fps));
        content.push_str(&format!("Mipmaps={}\n", flag(self.mipmaps)));
        content.push_str(&format!("SoftwareVramMb={}\n", self.software_vram_mb));
        content.push_str(&format!("VideoRenderer={renderer}\n"));
        content.push_str(&format!("Vsync={}\n", flag(self.vsync)));
        content
    }
}

// Global, mutable configuration instance.
static CONFIG: std::sync::LazyLock<Mutex<Config>> =
    std::sync::LazyLock::new(|| Mutex::new(Config::default()));

// --- File I/O ---

fn create_default_config_file() -> Result<(), std::io::Error> {
    info!("'{CONFIG_PATH}' not found, creating with default values.");
    std::fs::write(CONFIG_PATH, Config::default().to_ini_string())
}

pub fn load() {
    if !Path::new(CONFIG_PATH).exists()
        && let Err(e) = create_default_config_file()
    {
        warn!("Failed to create default config file: {e}");
    }

    let mut conf = SimpleIni::new();
    match conf.load(CONFIG_PATH) {
        Ok(()) => {
            let loaded = Config::from_ini(&conf);
            *CONFIG.lock().unwrap() = loaded;
            info!(
                "Configuration loaded from '{CONFIG_PATH}' (renderer {}, vsync {}).",
                loaded.video_renderer,
                if loaded.vsync { "on" } else { "off" }
            );
        }
        Err(e) => {
            warn!("Failed to load '{CONFIG_PATH}': {e}. Using default values.");
        }
    }
}

fn save() {
    let content = CONFIG.lock().unwrap().to_ini_string();
    if let Err(e) = std::fs::write(CONFIG_PATH, content) {
        warn!("Failed to save config file: {e}");
    }
}

pub fn get() -> Config {
    *CONFIG.lock().unwrap()
}

pub fn update_vsync(enabled: bool) {
    {
        let mut cfg = CONFIG.lock().unwrap();
        if cfg.vsync == enabled {
            return;
        }
        cfg.vsync = enabled;
    }
    save();
}

pub fn update_display_resolution(width: u32, height: u32) {
    {
        let mut cfg = CONFIG.lock().unwrap();
        if (cfg.display_width, cfg.display_height) == (width, height) {
            return;
        }
        cfg.display_width = width;
        cfg.display_height = height;
    }
    save();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ini(text: &str) -> SimpleIni {
        let mut ini = SimpleIni::new();
        ini.parse(text);
        ini
    }

    #[test]
    fn reads_every_option() {
        let cfg = Config::from_ini(&ini(
            "; comment\n\
             [Options]\n\
             VideoRenderer=software\n\
             Vsync=0\n\
             MaxFps=60\n\
             Mipmaps=0\n\
             ManagedTextures=0\n\
             GfxDebug=1\n\
             DisplayWidth=1280\n\
             DisplayHeight = 720\n\
             Fov=90\n\
             SoftwareVramMb=64\n\
             LogLevel=debug\n",
        ));
        assert_eq!(cfg.video_renderer, BackendType::Software);
        assert!(!cfg.vsync && !cfg.mipmaps && !cfg.managed_textures && cfg.gfx_debug);
        assert_eq!(cfg.max_fps, 60);
        assert_eq!((cfg.display_width, cfg.display_height), (1280, 720));
        assert_eq!(cfg.fov, 90.0);
        assert_eq!(cfg.software_vram_mb, 64);
        assert_eq!(cfg.log_level, LogLevel::Debug);
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let cfg = Config::from_ini(&ini(
            "[Options]\nVideoRenderer=d3d9\nVsync=yes\nDisplayWidth=0\nFov=400\nLogLevel=loud\n",
        ));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn keys_outside_options_are_ignored() {
        let cfg = Config::from_ini(&ini("Vsync=0\n[Other]\nMaxFps=30\n"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn frame_cap_becomes_minimum_frame_time() {
        let cfg = Config {
            max_fps: 50,
            ..Config::default()
        };
        assert_eq!(cfg.min_frame_ms(), 20.0);
        assert_eq!(Config::default().to_gfx_options().min_frame_ms, 0.0);
    }

    #[test]
    fn vram_budget_is_in_megabytes() {
        let cfg = Config {
            software_vram_mb: 2,
            ..Config::default()
        };
        assert_eq!(cfg.to_gfx_options().vram_budget, Some(2 * 1024 * 1024));
        assert_eq!(Config::default().to_gfx_options().vram_budget, None);
    }

    #[test]
    fn written_defaults_read_back_unchanged() {
        let defaults = Config::default();
        assert_eq!(Config::from_ini(&ini(&defaults.to_ini_string())), defaults);
    }

    #[test]
    fn log_levels_parse_case_insensitively() {
        assert_eq!("TRACE".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(LogLevel::Off.as_level_filter(), LevelFilter::Off);
    }
}
