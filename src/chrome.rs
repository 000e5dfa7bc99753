//! # Chrome Player
//!
//! [`PlaybackDriver`] implementation that drives the streaming service's web
//! player in a Chrome instance over the DevTools protocol.
//!
//! ## Session Flow
//!
//! 1. Launch Chrome with a persistent profile (cookies survive restarts)
//! 2. Open the preferences page, accept cookies, switch the UI to English
//! 3. Log in with the configured credentials
//! 4. Open the playlist and wait for the transport controls
//!
//! The selectors below target the web player's `data-testid` attributes.
//! They are the part most likely to break when the service ships a new
//! layout, which surfaces as element timeouts and, after the retry budget,
//! as a failure notification.

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::element::Element;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::{self, Config, Secret};
use crate::driver::PlaybackDriver;

const PREFERENCES_URL: &str = "https://open.spotify.com/preferences";

const COOKIE_ACCEPT: &str = "#onetrust-accept-btn-handler";
const LANGUAGE_SELECT: &str = r#"[id="desktop.settings.selectLanguage"]"#;
const LOGIN_BUTTON: &str = r#"[data-testid="login-button"]"#;
const LOGIN_USERNAME: &str = r#"[data-testid="login-username"]"#;
const LOGIN_PASSWORD: &str = r#"[data-testid="login-password"]"#;
const PLAYLIST_PLAY: &str = r#"div[data-testid="action-bar-row"] button[data-testid="play-button"]"#;
const TRANSPORT_PLAY_PAUSE: &str = r#"[data-testid="control-button-playpause"]"#;
const SHUFFLE_TOGGLE: &str = r#"[data-testid="control-button-shuffle"]"#;
const SKIP_FORWARD: &str = r#"[data-testid="control-button-skip-forward"]"#;

/// Present when another device on the account has taken over playback.
const PLAYING_ELSEWHERE_JS: &str = r#"Array.from(document.querySelectorAll('div > button > span'))
    .some(span => (span.textContent || '').includes('Playing on'))"#;

const UI_LANGUAGE: &str = "en-GB";

/// How long the cookie banner gets to show up before we assume there is none.
const COOKIE_BANNER_WAIT: Duration = Duration::from_secs(5);
const POLL_STEP: Duration = Duration::from_millis(250);
/// How long to wait for the transport to confirm a play/pause click.
const STATE_CHANGE_WAIT: Duration = Duration::from_secs(10);

/// Launch flags: quiet, muted, no images, no throttling when occluded.
const CHROME_FLAGS: &[&str] = &[
    "--disable-search-engine-choice-screen",
    "--mute-audio",
    "--autoplay-policy=no-user-gesture-required",
    "--blink-settings=imagesEnabled=false",
    "--disable-extensions",
    "--disable-webgl",
    "--disable-plugins",
    "--log-level=3",
    "--disable-dev-shm-usage",
    "--disable-renderer-backgrounding",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-client-side-phishing-detection",
    "--disable-crash-reporter",
    "--no-crash-upload",
    "--disable-gpu",
    "--disable-infobars",
    "--disable-blink-features=AutomationControlled",
    "--no-first-run",
    "--no-default-browser-check",
    "--dns-prefetch-disable",
];

/// What a play/pause click would do to the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportStep {
    Click,
    /// Already in the wanted state.
    Skip,
    /// The transport belongs to another device.
    Elsewhere,
}

/// While another device has playback the transport button mirrors that
/// device, so it must never be clicked.
fn transport_step(playing_elsewhere: bool, transport_playing: bool, want_playing: bool) -> TransportStep {
    if playing_elsewhere {
        TransportStep::Elsewhere
    } else if transport_playing == want_playing {
        TransportStep::Skip
    } else {
        TransportStep::Click
    }
}

async fn reset_profile(profile_dir: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::remove_dir_all(profile_dir).await {
        debug!("Could not remove profile directory: {e}");
    }
    tokio::fs::create_dir_all(profile_dir)
        .await
        .with_context(|| format!("Failed to recreate profile directory {}", profile_dir.display()))
}

/// Settings the browser session needs from [`Config`].
#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub playlist_link: String,
    pub username: String,
    pub password: Secret,
    pub headless: bool,
    pub element_timeout: Duration,
    pub request_timeout: Duration,
    pub chrome_executable: Option<PathBuf>,
    /// Browser profile; `None` uses the platform cache directory.
    pub profile_dir: Option<PathBuf>,
}

impl PlayerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            playlist_link: config.playlist_link.clone(),
            username: config.credentials.username.clone(),
            password: config.credentials.password.clone(),
            headless: config.headless,
            element_timeout: config.tuning.element_timeout,
            request_timeout: config.tuning.command_timeout,
            chrome_executable: config.chrome_executable.clone(),
            profile_dir: None,
        }
    }
}

/// Live browser plus the task pumping its CDP event stream.
struct Session {
    browser: Browser,
    page: Page,
    events: JoinHandle<()>,
}

/// Web player session in a local Chrome.
pub struct ChromePlayer {
    settings: PlayerSettings,
    session: Option<Session>,
    /// Whether the playlist has been started in this session; later starts
    /// resume through the transport button instead.
    started: bool,
}

impl ChromePlayer {
    /// Create a player. Nothing is launched until [`PlaybackDriver::sign_in`].
    pub fn new(settings: PlayerSettings) -> Self {
        Self {
            settings,
            session: None,
            started: false,
        }
    }

    fn page(&self) -> Result<&Page> {
        self.session
            .as_ref()
            .map(|session| &session.page)
            .ok_or_else(|| anyhow!("Browser session is not open"))
    }

    fn profile_dir(&self) -> Result<PathBuf> {
        match &self.settings.profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::get_profile_dir(),
        }
    }

    fn browser_config(&self, profile_dir: &Path) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile_dir)
            .request_timeout(self.settings.request_timeout)
            .no_sandbox();

        if self.settings.headless {
            builder = builder
                .headless_mode(HeadlessMode::New)
                .window_size(800, 600);
        } else {
            builder = builder.with_head();
        }

        if let Some(executable) = &self.settings.chrome_executable {
            builder = builder.chrome_executable(executable);
        }

        for flag in CHROME_FLAGS {
            builder = builder.arg(*flag);
        }

        builder.build().map_err(|e| anyhow!("Invalid browser configuration: {e}"))
    }

    /// Launch Chrome. A failed launch wipes the profile (stale locks from a
    /// crashed browser) and tries once more.
    async fn launch(&self) -> Result<(Browser, JoinHandle<()>)> {
        let profile_dir = self.profile_dir()?;

        let launched = match Browser::launch(self.browser_config(&profile_dir)?).await {
            Ok(launched) => launched,
            Err(e) => {
                warn!("Failed to launch Chrome: {e}. Resetting profile {} and retrying", profile_dir.display());
                reset_profile(&profile_dir).await?;

                Browser::launch(self.browser_config(&profile_dir)?)
                    .await
                    .context("Failed to launch Chrome. Ensure google-chrome or chromium is installed, or set CHROME_EXECUTABLE")?
            }
        };

        let (browser, mut handler) = launched;
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {e}");
                }
            }
        });

        info!("Chrome launched (headless: {})", self.settings.headless);
        Ok((browser, events))
    }

    async fn open_session(&mut self) -> Result<()> {
        let (browser, events) = self.launch().await?;

        let page = match browser.new_page(PREFERENCES_URL).await {
            Ok(page) => page,
            Err(e) => {
                events.abort();
                return Err(e).context("Failed to open the web player");
            }
        };

        self.session = Some(Session { browser, page, events });
        Ok(())
    }

    /// Poll for an element until it shows up or `timeout` passes.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<Element> {
        let page = self.page()?;
        let deadline = Instant::now() + timeout;

        loop {
            match page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(e) if Instant::now() >= deadline => {
                    return Err(anyhow!(e)).with_context(|| {
                        format!("Timed out after {}s waiting for {selector}", timeout.as_secs())
                    });
                }
                Err(_) => sleep(POLL_STEP).await,
            }
        }
    }

    async fn evaluate_bool(&self, script: &str) -> Result<bool> {
        self.page()?
            .evaluate(script)
            .await
            .context("Script evaluation failed")?
            .into_value::<bool>()
            .context("Script did not return a boolean")
    }

    /// Click through JavaScript; synthetic mouse clicks miss overlaid buttons.
    async fn click(&self, selector: &str) -> Result<()> {
        self.wait_for(selector, self.settings.element_timeout).await?;

        let target = serde_json::to_string(selector)?;
        let clicked = self
            .evaluate_bool(&format!(
                "(() => {{ const el = document.querySelector({target}); if (!el) return false; el.click(); return true; }})()"
            ))
            .await?;
        ensure!(clicked, "Element disappeared before click: {selector}");
        Ok(())
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>> {
        let element = self.wait_for(selector, self.settings.element_timeout).await?;
        element
            .attribute(name)
            .await
            .with_context(|| format!("Failed to read {name} of {selector}"))
    }

    async fn accept_cookies(&self) -> Result<()> {
        match self.wait_for(COOKIE_ACCEPT, COOKIE_BANNER_WAIT).await {
            Ok(_) => {
                self.click(COOKIE_ACCEPT).await?;
                info!("Cookies accepted");
            }
            Err(_) => debug!("No cookie banner shown"),
        }
        Ok(())
    }

    /// The selectors and labels we match on are English.
    async fn switch_language(&self) -> Result<()> {
        self.wait_for(LANGUAGE_SELECT, self.settings.element_timeout).await?;

        let target = serde_json::to_string(LANGUAGE_SELECT)?;
        let language = serde_json::to_string(UI_LANGUAGE)?;
        let changed = self
            .evaluate_bool(&format!(
                "(() => {{ const el = document.querySelector({target}); if (!el) return false; \
                 el.value = {language}; el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }})()"
            ))
            .await?;
        ensure!(changed, "Language selector not found");

        self.page()?
            .goto(PREFERENCES_URL)
            .await
            .context("Failed to reload preferences")?;
        info!("Changed language to {UI_LANGUAGE}");
        Ok(())
    }

    async fn log_in(&self) -> Result<()> {
        self.click(LOGIN_BUTTON).await.context("login 1/4")?;

        self.wait_for(LOGIN_USERNAME, self.settings.element_timeout)
            .await
            .context("login 2/4")?
            .click()
            .await?
            .type_str(&self.settings.username)
            .await?;

        self.wait_for(LOGIN_PASSWORD, self.settings.element_timeout)
            .await
            .context("login 3/4")?
            .click()
            .await?
            .type_str(self.settings.password.expose())
            .await?;

        self.click(LOGIN_BUTTON).await.context("login 4/4")?;
        info!("Logged in as {}", self.settings.username);
        Ok(())
    }

    async fn open_playlist(&self) -> Result<()> {
        self.page()?
            .goto(self.settings.playlist_link.as_str())
            .await
            .with_context(|| format!("Failed to open playlist {}", self.settings.playlist_link))?;

        // Login redirects can take a while; the playlist button shows up last.
        let patience = self.settings.element_timeout * 2;
        self.wait_for(PLAYLIST_PLAY, patience).await?;
        self.wait_for(TRANSPORT_PLAY_PAUSE, patience).await?;
        info!("Playlist page ready");
        Ok(())
    }

    async fn transport_playing(&self) -> Result<bool> {
        let label = self.attribute(TRANSPORT_PLAY_PAUSE, "aria-label").await?;
        Ok(label.as_deref() == Some("Pause"))
    }

    async fn wait_for_playing(&self, playing: bool) -> Result<()> {
        let deadline = Instant::now() + STATE_CHANGE_WAIT;
        while self.transport_playing().await? != playing {
            if Instant::now() >= deadline {
                bail!(
                    "Player did not {} within {}s",
                    if playing { "start" } else { "pause" },
                    STATE_CHANGE_WAIT.as_secs()
                );
            }
            sleep(POLL_STEP).await;
        }
        Ok(())
    }

    async fn set_shuffle(&self, shuffle: bool) -> Result<()> {
        let checked = self.attribute(SHUFFLE_TOGGLE, "aria-checked").await?;
        if (checked.as_deref() == Some("true")) == shuffle {
            return Ok(());
        }

        self.click(SHUFFLE_TOGGLE).await?;
        let deadline = Instant::now() + STATE_CHANGE_WAIT;
        while Instant::now() < deadline {
            let checked = self.attribute(SHUFFLE_TOGGLE, "aria-checked").await?;
            if checked.as_deref() == Some(if shuffle { "true" } else { "false" }) {
                debug!("Shuffle set to {shuffle}");
                return Ok(());
            }
            sleep(POLL_STEP).await;
        }
        warn!("Shuffle toggle did not confirm {shuffle}, continuing");
        Ok(())
    }

    async fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Err(e) = session.browser.close().await {
            debug!("Browser close failed: {e}");
        }
        if let Err(e) = session.browser.wait().await {
            debug!("Waiting for browser exit failed: {e}");
        }
        session.events.abort();
        info!("Browser session closed");
    }
}

#[async_trait]
impl PlaybackDriver for ChromePlayer {
    async fn sign_in(&mut self) -> Result<()> {
        self.close_session().await;
        self.started = false;

        self.open_session().await?;
        self.accept_cookies().await?;
        self.switch_language().await?;
        self.log_in().await?;
        self.open_playlist().await
    }

    async fn is_playing_elsewhere(&mut self) -> Result<bool> {
        self.evaluate_bool(PLAYING_ELSEWHERE_JS).await
    }

    async fn start_or_resume(&mut self, playlist: &str, shuffle: bool) -> Result<()> {
        let elsewhere = self.evaluate_bool(PLAYING_ELSEWHERE_JS).await?;
        match transport_step(elsewhere, self.transport_playing().await?, true) {
            TransportStep::Elsewhere => bail!("Another device has playback, not taking it over"),
            TransportStep::Skip => {
                debug!("Already playing");
                return Ok(());
            }
            TransportStep::Click => {}
        }

        if self.started {
            self.click(TRANSPORT_PLAY_PAUSE).await?;
            self.wait_for_playing(true).await?;
            info!("Resumed playback");
            return Ok(());
        }

        let current = self.page()?.url().await.context("Failed to read page URL")?;
        if current.as_deref() != Some(playlist) {
            self.page()?
                .goto(playlist)
                .await
                .with_context(|| format!("Failed to open playlist {playlist}"))?;
        }

        self.click(PLAYLIST_PLAY).await?;
        self.wait_for_playing(true).await?;
        self.set_shuffle(shuffle).await?;
        if shuffle {
            // Shuffled playback still begins on the first track.
            self.click(SKIP_FORWARD).await?;
        }

        self.started = true;
        info!("Started playlist (shuffle: {shuffle})");
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        let elsewhere = self.evaluate_bool(PLAYING_ELSEWHERE_JS).await?;
        match transport_step(elsewhere, self.transport_playing().await?, false) {
            TransportStep::Elsewhere => {
                info!("Another device has playback, local session already displaced");
                return Ok(());
            }
            TransportStep::Skip => {
                debug!("Local session not playing, nothing to pause");
                return Ok(());
            }
            TransportStep::Click => {}
        }

        self.click(TRANSPORT_PLAY_PAUSE).await?;
        self.wait_for_playing(false).await?;
        info!("Paused playback");
        Ok(())
    }

    async fn is_actively_playing(&mut self) -> Result<bool> {
        self.transport_playing().await
    }

    async fn shutdown(&mut self) {
        self.close_session().await;
    }
}

impl Drop for ChromePlayer {
    fn drop(&mut self) {
        // Dropping the Browser kills the child process; stop the event pump too.
        if let Some(session) = self.session.take() {
            session.events.abort();
        }
    }
}
