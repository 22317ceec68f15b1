// Audible feedback that does not depend on the GPU
use claritylayer_core::{log_error, log_info, log_warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sound {
    Enable,
    Disable,
    ProfileSwitch,
    PanicOff,
    Error,
}

impl Sound {
    pub fn file_name(self) -> &'static str {
        match self {
            Sound::Enable => "enable.wav",
            Sound::Disable => "disable.wav",
            Sound::ProfileSwitch => "profile.wav",
            Sound::PanicOff => "panic.wav",
            Sound::Error => "error.wav",
        }
    }
}

/// One independent way of making a noise.
pub trait AudioChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn alert(&self) -> anyhow::Result<()>;
}

pub struct AudioFeedback {
    panic_channels: Vec<Box<dyn AudioChannel>>,
    sounds_dir: Option<PathBuf>,
    cues_enabled: bool,
}

impl AudioFeedback {
    pub fn new(panic_channels: Vec<Box<dyn AudioChannel>>, sounds_dir: Option<PathBuf>, cues_enabled: bool) -> Self {
        Self {
            panic_channels,
            sounds_dir,
            cues_enabled,
        }
    }

    /// The platform's panic channels plus WAV cues from `sounds_dir`.
    pub fn system(sounds_dir: Option<PathBuf>, cues_enabled: bool) -> Self {
        Self::new(platform::panic_channels(), sounds_dir, cues_enabled)
    }

    /// Feedback with no panic channels and no cues.
    pub fn silent() -> Self {
        Self::new(Vec::new(), None, false)
    }

    pub fn channel_count(&self) -> usize {
        self.panic_channels.len()
    }

    /// Fires every panic channel. Returns how many succeeded.
    pub fn panic_confirmation(&self) -> usize {
        let mut delivered = 0;
        for channel in &self.panic_channels {
            match catch_unwind(AssertUnwindSafe(|| channel.alert())) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => log_warn!("Audio channel {} failed: {}", channel.name(), e),
                Err(_) => log_warn!("Audio channel {} panicked", channel.name()),
            }
        }
        if delivered == 0 && !self.panic_channels.is_empty() {
            log_error!("No audio channel confirmed panic-off");
        } else {
            log_info!("Panic-off confirmed on {}/{} audio channels", delivered, self.panic_channels.len());
        }
        delivered
    }

    /// Plays a non-critical cue. Missing files fall back to the system beep.
    pub fn play(&self, sound: Sound) {
        if !self.cues_enabled {
            return;
        }
        let path = self
            .sounds_dir
            .as_deref()
            .map(|dir| dir.join(sound.file_name()))
            .filter(|p| p.exists());

        if let Err(e) = platform::play_cue(path.as_deref()) {
            tracing::debug!("Cue {:?} not played: {}", sound, e);
        }
    }

    pub fn sounds_dir(&self) -> Option<&Path> {
        self.sounds_dir.as_deref()
    }
}

#[cfg(windows)]
mod platform {
    use super::AudioChannel;
    use std::path::Path;
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Media::Audio::{PlaySoundW, SND_ALIAS_ID, SND_ASYNC, SND_FILENAME, SND_NODEFAULT};
    use windows::Win32::System::Diagnostics::Debug::Beep;
    use windows::Win32::UI::WindowsAndMessaging::{MessageBeep, MB_ICONHAND, MB_OK};

    // sndAlias('S', '!')
    const SND_ALIAS_SYSTEMEXCLAMATION: usize = 0x2153;

    struct MessageBeepChannel;

    impl AudioChannel for MessageBeepChannel {
        fn name(&self) -> &'static str {
            "message-beep"
        }

        fn alert(&self) -> anyhow::Result<()> {
            unsafe { MessageBeep(MB_ICONHAND)? };
            Ok(())
        }
    }

    struct SystemSoundChannel;

    impl AudioChannel for SystemSoundChannel {
        fn name(&self) -> &'static str {
            "system-exclamation"
        }

        fn alert(&self) -> anyhow::Result<()> {
            let ok = unsafe {
                PlaySoundW(
                    PCWSTR(SND_ALIAS_SYSTEMEXCLAMATION as *const u16),
                    None,
                    SND_ALIAS_ID | SND_ASYNC,
                )
            };
            if !ok.as_bool() {
                anyhow::bail!("PlaySoundW rejected the exclamation alias");
            }
            Ok(())
        }
    }

    /// Descending three-tone sequence on its own thread.
    struct ToneChannel;

    impl AudioChannel for ToneChannel {
        fn name(&self) -> &'static str {
            "tone-sequence"
        }

        fn alert(&self) -> anyhow::Result<()> {
            std::thread::Builder::new()
                .name("panic-tones".to_string())
                .spawn(|| unsafe {
                    let _ = Beep(800, 200);
                    let _ = Beep(600, 200);
                    let _ = Beep(400, 300);
                })?;
            Ok(())
        }
    }

    pub fn panic_channels() -> Vec<Box<dyn AudioChannel>> {
        vec![
            Box::new(MessageBeepChannel),
            Box::new(SystemSoundChannel),
            Box::new(ToneChannel),
        ]
    }

    pub fn play_cue(path: Option<&Path>) -> anyhow::Result<()> {
        match path {
            Some(path) => {
                let wide = HSTRING::from(path.as_os_str());
                let ok = unsafe { PlaySoundW(&wide, None, SND_FILENAME | SND_ASYNC | SND_NODEFAULT) };
                if !ok.as_bool() {
                    anyhow::bail!("PlaySoundW failed for {}", path.display());
                }
            }
            None => unsafe { MessageBeep(MB_OK)? },
        }
        Ok(())
    }
}

#[cfg(not(windows))]
mod platform {
    use super::AudioChannel;
    use std::io::Write;
    use std::path::Path;
    use std::process::{Command, Stdio};

    /// BEL on the controlling terminal, or stderr when there is none.
    struct TerminalBell;

    impl AudioChannel for TerminalBell {
        fn name(&self) -> &'static str {
            "terminal-bell"
        }

        fn alert(&self) -> anyhow::Result<()> {
            match std::fs::OpenOptions::new().write(true).open("/dev/tty") {
                Ok(mut tty) => tty.write_all(b"\x07")?,
                Err(_) => {
                    let mut err = std::io::stderr();
                    err.write_all(b"\x07")?;
                    err.flush()?;
                }
            }
            Ok(())
        }
    }

    /// Desktop sound server, reached through its command-line player.
    struct SoundServer {
        player: &'static str,
        sound: &'static str,
    }

    impl SoundServer {
        fn platform() -> Self {
            if cfg!(target_os = "macos") {
                Self {
                    player: "afplay",
                    sound: "/System/Library/Sounds/Basso.aiff",
                }
            } else {
                Self {
                    player: "paplay",
                    sound: "/usr/share/sounds/freedesktop/stereo/dialog-warning.oga",
                }
            }
        }
    }

    impl AudioChannel for SoundServer {
        fn name(&self) -> &'static str {
            "sound-server"
        }

        fn alert(&self) -> anyhow::Result<()> {
            if !Path::new(self.sound).exists() {
                anyhow::bail!("alert sound {} not installed", self.sound);
            }
            // Not waited on; the player exits by itself
            Command::new(self.player)
                .arg(self.sound)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()?;
            Ok(())
        }
    }

    pub fn panic_channels() -> Vec<Box<dyn AudioChannel>> {
        vec![Box::new(TerminalBell), Box::new(SoundServer::platform())]
    }

    pub fn play_cue(path: Option<&Path>) -> anyhow::Result<()> {
        if let Some(path) = path {
            tracing::debug!("No WAV playback on this platform ({})", path.display());
        }
        Ok(())
    }
}
