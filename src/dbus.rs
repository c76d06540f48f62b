// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use dbus::arg::TypeMismatchError;
use dbus::channel::MatchingReceiver;
use dbus::channel::Sender;
use dbus::message::MatchRule;
use dbus::message::Message;
use dbus::nonblock::Proxy;
use dbus::nonblock::SyncConnection;
use dbus_crossroads::Crossroads;
use dbus_crossroads::IfaceBuilder;
use dbus_crossroads::IfaceToken;
use dbus_crossroads::MethodErr;
use dbus_tokio::connection;
use log::error;
use log::info;
use log::warn;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::als::AmbientLightSensor;
use crate::backlight::SysfsBacklight;
use crate::backlight_controller::BacklightController;
use crate::backlight_controller::BacklightControllerObserver;
use crate::backlight_controller::ExternalBacklightController;
use crate::backlight_controller::InternalBacklightController;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::common::read_file_to_u64;
use crate::common::BrightnessChangeCause;
use crate::common::PluggedState;
use crate::common::TransitionStyle;
use crate::daemon::Daemon;
use crate::daemon::DaemonDelegate;
use crate::daemon::ShutdownReason;
use crate::idle::ActivityIdleDetector;
use crate::logging;
use crate::name_owner_listener::monitor_lost_names;
use crate::name_owner_listener::NameLostCallback;
use crate::power_supply::DirectoryPowerSourceProvider;
use crate::power_supply::PowerSourceProvider;
use crate::prefs;
use crate::prefs::watch_prefs_dir;
use crate::prefs::DirectoryPrefs;
use crate::prefs::Prefs;
use crate::state_control::StateOverrideRequest;
use crate::suspender::SuspendDelegate;

const SERVICE_NAME: &str = "org.chromium.PowerManager";
const PATH_NAME: &str = "/org/chromium/PowerManager";
const INTERFACE_NAME: &str = SERVICE_NAME;

const SESSION_MANAGER_SERVICE_NAME: &str = "org.chromium.SessionManager";
const SESSION_MANAGER_PATH_NAME: &str = "/org/chromium/SessionManager";
const SESSION_MANAGER_INTERFACE_NAME: &str = "org.chromium.SessionManagerInterface";

const CRAS_INTERFACE_NAME: &str = "org.chromium.cras.Control";

pub const DEFAULT_DBUS_TIMEOUT: Duration = Duration::from_secs(5);

const POWER_SUPPLY_POLL_INTERVAL: Duration = Duration::from_secs(30);
const ALS_POLL_INTERVAL: Duration = Duration::from_secs(1);

const WAKEUP_COUNT_PATH: &str = "sys/power/wakeup_count";
const OOBE_COMPLETED_PATH: &str = "home/chronos/.oobe_completed";
const POWERD_SUSPEND_PATH: &str = "/usr/bin/powerd_suspend";
const SETUID_HELPER_PATH: &str = "/usr/bin/powerd_setuid_helper";

pub struct ServiceOptions {
    pub root: PathBuf,
    pub prefs_dir: PathBuf,
    pub default_prefs_dir: PathBuf,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        ServiceOptions {
            root: PathBuf::from("/"),
            prefs_dir: PathBuf::from(prefs::DEFAULT_READ_WRITE_PREFS_DIR),
            default_prefs_dir: PathBuf::from(prefs::DEFAULT_READ_ONLY_PREFS_DIR),
        }
    }
}

fn lock(daemon: &Mutex<Daemon>) -> MutexGuard<'_, Daemon> {
    daemon.lock().unwrap_or_else(PoisonError::into_inner)
}

// Context data for the D-Bus service.
#[derive(Clone)]
struct DbusContext {
    daemon: Arc<Mutex<Daemon>>,
    clock: Arc<dyn Clock>,
    // Wakes the timer pump after any event so it picks up new deadlines.
    wake: Arc<Notify>,
}

impl DbusContext {
    fn with_daemon<R>(&self, f: impl FnOnce(&mut Daemon) -> R) -> R {
        let result = f(&mut lock(&self.daemon));
        self.wake.notify_one();
        result
    }
}

fn send_signal(conn: &SyncConnection, msg: Message) {
    if conn.send(msg).is_err() {
        error!("Send power manager signal failed.");
    }
}

fn power_manager_signal(name: &str) -> Message {
    Message::signal(&PATH_NAME.into(), &INTERFACE_NAME.into(), &name.into())
}

fn request_screen_lock(conn: &Arc<SyncConnection>) {
    let proxy = Proxy::new(
        SESSION_MANAGER_SERVICE_NAME,
        SESSION_MANAGER_PATH_NAME,
        DEFAULT_DBUS_TIMEOUT,
        conn.clone(),
    );
    tokio::spawn(async move {
        let result: Result<(), dbus::Error> = proxy
            .method_call(SESSION_MANAGER_INTERFACE_NAME, "LockScreen", ())
            .await;
        if let Err(e) = result {
            error!("Failed to ask the session manager to lock the screen: {}", e);
        }
    });
}

// Runs a helper program off the event loop. Returns whether it exited
// successfully.
async fn run_helper(program: &'static str, args: Vec<String>) -> bool {
    info!("Running {} {}", program, args.join(" "));
    let result =
        tokio::task::spawn_blocking(move || Command::new(program).args(&args).status()).await;
    match result {
        Ok(Ok(status)) if status.success() => true,
        Ok(Ok(status)) => {
            error!("{} failed: {}", program, status);
            false
        }
        Ok(Err(e)) => {
            error!("Failed to run {}: {}", program, e);
            false
        }
        Err(e) => {
            error!("{} task failed: {}", program, e);
            false
        }
    }
}

struct BrightnessSignalObserver {
    conn: Arc<SyncConnection>,
}

impl BacklightControllerObserver for BrightnessSignalObserver {
    fn on_brightness_changed(&self, brightness_percent: f64, cause: BrightnessChangeCause) {
        let msg = power_manager_signal("BrightnessChanged").append2(
            brightness_percent.round() as i32,
            cause == BrightnessChangeCause::UserInitiated,
        );
        send_signal(&self.conn, msg);
    }
}

struct DbusSuspendDelegate {
    conn: Arc<SyncConnection>,
    root: PathBuf,
    // Reports a failed suspend command back to the service loop.
    resume_sender: UnboundedSender<()>,
}

impl SuspendDelegate for DbusSuspendDelegate {
    fn read_wakeup_count(&mut self) -> Option<u64> {
        let path = self.root.join(WAKEUP_COUNT_PATH);
        match read_file_to_u64(&path) {
            Ok(count) => Some(count),
            Err(e) => {
                warn!("Failed to read {}: {:#}", path.display(), e);
                None
            }
        }
    }

    fn announce_suspend(&mut self, sequence_number: u32) {
        send_signal(
            &self.conn,
            power_manager_signal("SuspendDelay").append1(sequence_number),
        );
    }

    fn lock_screen(&mut self) {
        request_screen_lock(&self.conn);
    }

    fn suspend(&mut self, wakeup_count: Option<u64>) {
        let args = wakeup_count
            .map(|count| vec![format!("--wakeup_count={}", count)])
            .unwrap_or_default();
        let resume_sender = self.resume_sender.clone();
        tokio::spawn(async move {
            if !run_helper(POWERD_SUSPEND_PATH, args).await {
                // Nothing else reports a resume for a failed attempt.
                let _ = resume_sender.send(());
            }
        });
    }
}

struct DbusDaemonDelegate {
    conn: Arc<SyncConnection>,
    root: PathBuf,
}

impl DaemonDelegate for DbusDaemonDelegate {
    fn emit_idle_notify(&mut self, threshold_ms: i64) {
        send_signal(
            &self.conn,
            power_manager_signal("IdleNotify").append1(threshold_ms),
        );
    }

    fn emit_active_notify(&mut self) {
        send_signal(&self.conn, power_manager_signal("ActiveNotify").append1(0i64));
    }

    fn lock_screen(&mut self) {
        request_screen_lock(&self.conn);
    }

    fn shut_down(&mut self, reason: ShutdownReason) {
        let args = vec![
            "--action=shut_down".to_string(),
            format!("--shutdown_reason={}", reason),
        ];
        tokio::spawn(run_helper(SETUID_HELPER_PATH, args));
    }

    fn restart(&mut self) {
        let args = vec![
            "--action=reboot".to_string(),
            format!("--shutdown_reason={}", ShutdownReason::UserRequest),
        ];
        tokio::spawn(run_helper(SETUID_HELPER_PATH, args));
    }

    fn is_oobe_completed(&self) -> bool {
        self.root.join(OOBE_COMPLETED_PATH).exists()
    }
}

struct SuspendDelayReaper {
    context: DbusContext,
}

impl NameLostCallback for SuspendDelayReaper {
    fn on_name_lost(&self, name: &str) -> Result<()> {
        self.context
            .with_daemon(|daemon| daemon.on_name_owner_lost(name));
        Ok(())
    }
}

fn sender_name(ctx: &dbus_crossroads::Context) -> Result<String, MethodErr> {
    ctx.message()
        .sender()
        .map(|sender| sender.to_string())
        .ok_or_else(|| MethodErr::failed("Missing sender"))
}

fn register_interface(cr: &mut Crossroads) -> IfaceToken<DbusContext> {
    cr.register(INTERFACE_NAME, |b: &mut IfaceBuilder<DbusContext>| {
        b.method("IncreaseScreenBrightness", (), (), move |_, context, ()| {
            context.with_daemon(|daemon| daemon.increase_screen_brightness());
            Ok(())
        });
        b.method(
            "DecreaseScreenBrightness",
            ("allow_off",),
            (),
            move |_, context, (allow_off,): (bool,)| {
                context.with_daemon(|daemon| daemon.decrease_screen_brightness(allow_off));
                Ok(())
            },
        );
        b.method(
            "SetScreenBrightnessPercent",
            ("percent", "style"),
            (),
            move |_, context, (percent, style_raw): (f64, u32)| {
                let style = TransitionStyle::try_from(style_raw)
                    .map_err(|_| MethodErr::failed("Unsupported transition style"))?;
                context.with_daemon(|daemon| daemon.set_screen_brightness_percent(percent, style));
                Ok(())
            },
        );
        b.method(
            "GetScreenBrightnessPercent",
            (),
            ("percent",),
            move |_, context, ()| {
                context
                    .with_daemon(|daemon| daemon.get_screen_brightness_percent())
                    .map(|percent| (percent,))
                    .map_err(|e| {
                        error!("GetScreenBrightnessPercent failed: {}", e);
                        MethodErr::failed("Could not read brightness")
                    })
            },
        );
        b.method("GetIdleTime", (), ("time_ms",), move |_, context, ()| {
            Ok((context.with_daemon(|daemon| daemon.get_idle_time_ms()),))
        });
        b.method(
            "RequestIdleNotification",
            ("threshold_ms",),
            (),
            move |_, context, (threshold_ms,): (i64,)| {
                context.with_daemon(|daemon| daemon.request_idle_notification(threshold_ms));
                Ok(())
            },
        );
        b.method(
            "HandleUserActivity",
            ("time_since_ms",),
            (),
            move |_, context, (time_since_ms,): (i64,)| {
                let since = Duration::from_millis(time_since_ms.max(0) as u64);
                let now = context.clock.now();
                let when = now.checked_sub(since).unwrap_or(now);
                context.with_daemon(|daemon| daemon.handle_user_activity(when));
                Ok(())
            },
        );
        b.method("HandleVideoActivity", (), (), move |_, context, ()| {
            let now = context.clock.now();
            context.with_daemon(|daemon| daemon.handle_video_activity(now));
            Ok(())
        });
        b.method("RequestShutdown", (), (), move |_, context, ()| {
            context.with_daemon(|daemon| daemon.request_shutdown());
            Ok(())
        });
        b.method("RequestRestart", (), (), move |_, context, ()| {
            context.with_daemon(|daemon| daemon.request_restart());
            Ok(())
        });
        b.method(
            "SetIsProjecting",
            ("is_projecting",),
            (),
            move |_, context, (is_projecting,): (bool,)| {
                context.with_daemon(|daemon| daemon.set_is_projecting(is_projecting));
                Ok(())
            },
        );
        b.method(
            "StateOverrideRequest",
            (
                "request_id",
                "duration_sec",
                "disable_idle_dim",
                "disable_idle_blank",
                "disable_idle_suspend",
                "disable_lid_suspend",
            ),
            ("request_id",),
            move |_,
                  context,
                  (
                request_id,
                duration_sec,
                disable_idle_dim,
                disable_idle_blank,
                disable_idle_suspend,
                disable_lid_suspend,
            ): (u32, u32, bool, bool, bool, bool)| {
                let request = StateOverrideRequest {
                    request_id,
                    duration_sec,
                    disable_idle_dim,
                    disable_idle_blank,
                    disable_idle_suspend,
                    disable_lid_suspend,
                };
                match context.with_daemon(|daemon| daemon.state_override_request(request)) {
                    Ok(request_id) => Ok((request_id as i32,)),
                    Err(e) => {
                        warn!("Rejected state override request: {}", e);
                        Err(MethodErr::failed(&e))
                    }
                }
            },
        );
        b.method(
            "StateOverrideCancel",
            ("request_id",),
            (),
            move |_, context, (request_id,): (i32,)| {
                context.with_daemon(|daemon| daemon.state_override_cancel(request_id as u32));
                Ok(())
            },
        );
        b.method(
            "RegisterSuspendDelay",
            ("delay_ms",),
            (),
            move |ctx, context, (delay_ms,): (u32,)| {
                let client = sender_name(ctx)?;
                context.with_daemon(|daemon| daemon.register_suspend_delay(&client, delay_ms));
                Ok(())
            },
        );
        b.method("UnregisterSuspendDelay", (), (), move |ctx, context, ()| {
            let client = sender_name(ctx)?;
            if !context.with_daemon(|daemon| daemon.unregister_suspend_delay(&client)) {
                warn!("{} had no suspend delay registered", client);
            }
            Ok(())
        });
        b.method(
            "SuspendReady",
            ("sequence_number",),
            (),
            move |ctx, context, (sequence_number,): (u32,)| {
                let client = sender_name(ctx)?;
                context.with_daemon(|daemon| daemon.suspend_ready(&client, sequence_number));
                Ok(())
            },
        );
        b.method(
            "SetLogLevel",
            ("level",),
            (),
            move |_, _, (level_raw,): (u8,)| {
                logging::set_log_level(level_raw)
                    .map(|_| ())
                    .map_err(|_| MethodErr::failed("Unsupported log level value"))
            },
        );
    })
}

async fn watch_signal<F>(
    conn: &Arc<SyncConnection>,
    context: &DbusContext,
    interface: &'static str,
    member: &'static str,
    handler: F,
) -> Result<()>
where
    F: Fn(&Message, &mut Daemon) -> std::result::Result<(), TypeMismatchError>
        + Send
        + Sync
        + 'static,
{
    let rule = MatchRule::new_signal(interface, member);
    conn.add_match_no_cb(&rule.match_str())
        .await
        .with_context(|| format!("Failed to add match for {}", member))?;

    let context = context.clone();
    conn.start_receive(
        rule,
        Box::new(move |msg, _| {
            if let Err(e) = context.with_daemon(|daemon| handler(&msg, daemon)) {
                error!("error reading D-Bus signal {}. {}", member, e);
            }
            true
        }),
    );
    Ok(())
}

async fn watch_signals(conn: &Arc<SyncConnection>, context: &DbusContext) -> Result<()> {
    watch_signal(conn, context, INTERFACE_NAME, "RequestSuspend", |_, daemon| {
        daemon.request_suspend();
        Ok(())
    })
    .await?;
    watch_signal(conn, context, INTERFACE_NAME, "PowerStateChanged", |msg, daemon| {
        let state: String = msg.read1()?;
        daemon.on_power_state_changed(&state);
        Ok(())
    })
    .await?;
    watch_signal(conn, context, INTERFACE_NAME, "LidClosed", |_, daemon| {
        daemon.on_lid_closed();
        Ok(())
    })
    .await?;
    watch_signal(conn, context, INTERFACE_NAME, "LidOpened", |_, daemon| {
        daemon.on_lid_opened();
        Ok(())
    })
    .await?;
    watch_signal(conn, context, INTERFACE_NAME, "ButtonEvent", |msg, daemon| {
        let (button_name, down): (String, bool) = msg.read2()?;
        daemon.on_button_event(&button_name, down);
        Ok(())
    })
    .await?;
    watch_signal(
        conn,
        context,
        SESSION_MANAGER_INTERFACE_NAME,
        "SessionStateChanged",
        |msg, daemon| {
            let state: String = msg.read1()?;
            daemon.on_session_state_changed(&state);
            Ok(())
        },
    )
    .await?;
    watch_signal(
        conn,
        context,
        SESSION_MANAGER_INTERFACE_NAME,
        "ScreenIsLocked",
        |_, daemon| {
            daemon.on_screen_locked();
            Ok(())
        },
    )
    .await?;
    watch_signal(
        conn,
        context,
        SESSION_MANAGER_INTERFACE_NAME,
        "ScreenIsUnlocked",
        |_, daemon| {
            daemon.on_screen_unlocked();
            Ok(())
        },
    )
    .await?;
    watch_signal(
        conn,
        context,
        CRAS_INTERFACE_NAME,
        "NumberOfActiveStreamsChanged",
        |msg, daemon| {
            let num_streams: i32 = msg.read1()?;
            daemon.set_active_audio_streams(num_streams);
            Ok(())
        },
    )
    .await?;
    Ok(())
}

fn create_backlight_controller(
    root: &Path,
    prefs: Arc<dyn Prefs>,
    clock: Arc<dyn Clock>,
    has_als: bool,
) -> Box<dyn BacklightController> {
    match SysfsBacklight::find(root) {
        Ok(device) => {
            info!("Using backlight {}", device.dir().display());
            let mut controller =
                InternalBacklightController::new(Box::new(device), prefs, clock, has_als);
            if controller.init() {
                return Box::new(controller);
            }
            error!("Falling back to external backlight control");
        }
        Err(e) => info!("No internal backlight: {:#}", e),
    }
    Box::new(ExternalBacklightController::new())
}

fn update_plugged_state(context: &DbusContext, provider: &dyn PowerSourceProvider) {
    match provider.get_plugged_state() {
        Ok(plugged_state) => {
            let is_plugged = plugged_state == PluggedState::Connected;
            context.with_daemon(|daemon| daemon.set_plugged(is_plugged));
        }
        Err(e) => error!("Failed to read power supply state: {:#}", e),
    }
}

// Sleeps until the earliest daemon deadline or the next event, then runs
// whatever is due.
async fn pump_timers(context: DbusContext) {
    loop {
        let deadline = lock(&context.daemon).next_deadline();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    _ = context.wake.notified() => {}
                }
            }
            None => context.wake.notified().await,
        }
        lock(&context.daemon).handle_timers();
    }
}

pub async fn service_main(options: ServiceOptions) -> Result<()> {
    let root = options.root.as_path();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let prefs: Arc<dyn Prefs> = Arc::new(DirectoryPrefs::new(vec![
        options.prefs_dir.clone(),
        options.default_prefs_dir.clone(),
    ]));
    let has_als = prefs
        .get_bool(prefs::HAS_AMBIENT_LIGHT_SENSOR_PREF)
        .unwrap_or(false);

    let (io_resource, conn) = connection::new_system_sync()?;

    // io_resource must be awaited to start receiving D-Bus message.
    let _handle = tokio::spawn(async {
        let err = io_resource.await;
        panic!("Lost connection to D-Bus: {}", err);
    });

    let mut backlight = create_backlight_controller(root, prefs.clone(), clock.clone(), has_als);
    backlight.set_observer(Some(Box::new(BrightnessSignalObserver { conn: conn.clone() })));

    let (resume_sender, mut resume_receiver) = unbounded_channel();
    let daemon = Daemon::new(
        prefs.clone(),
        clock.clone(),
        backlight,
        Box::new(ActivityIdleDetector::new(clock.clone())),
        Box::new(DbusSuspendDelegate {
            conn: conn.clone(),
            root: root.to_path_buf(),
            resume_sender,
        }),
        Box::new(DbusDaemonDelegate {
            conn: conn.clone(),
            root: root.to_path_buf(),
        }),
    )
    .context("Failed to configure power policy")?;

    let context = DbusContext {
        daemon: Arc::new(Mutex::new(daemon)),
        clock,
        wake: Arc::new(Notify::new()),
    };

    let power_source = DirectoryPowerSourceProvider {
        root: root.to_path_buf(),
    };
    let is_plugged = match power_source.get_plugged_state() {
        Ok(plugged_state) => plugged_state == PluggedState::Connected,
        Err(e) => {
            warn!("Power source unknown at startup, assuming battery: {:#}", e);
            false
        }
    };
    context.with_daemon(|daemon| daemon.set_plugged(is_plugged));

    conn.request_name(SERVICE_NAME, false, true, false).await?;

    let mut cr = Crossroads::new();

    // Enable asynchronous methods. Incoming method calls are spawned as separate tasks if
    // necessary.
    cr.set_async_support(Some((
        conn.clone(),
        Box::new(|x| {
            tokio::spawn(x);
        }),
    )));

    let token = register_interface(&mut cr);
    cr.insert(PATH_NAME, &[token], context.clone());

    watch_signals(&conn, &context).await?;
    monitor_lost_names(
        &conn,
        SuspendDelayReaper {
            context: context.clone(),
        },
    )
    .await
    .context("start name owner monitoring")?;

    conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| match cr.handle_message(msg, conn) {
            Ok(()) => true,
            Err(()) => {
                error!("error handling D-Bus message");
                false
            }
        }),
    );

    let resume_context = context.clone();
    tokio::spawn(async move {
        while resume_receiver.recv().await.is_some() {
            resume_context.with_daemon(|daemon| daemon.on_resume());
        }
    });

    let power_context = context.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POWER_SUPPLY_POLL_INTERVAL);
        loop {
            interval.tick().await;
            update_plugged_state(&power_context, &power_source);
        }
    });

    if has_als {
        match AmbientLightSensor::find(root) {
            Ok(sensor) => {
                let als_context = context.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(ALS_POLL_INTERVAL);
                    loop {
                        interval.tick().await;
                        match sensor.read_percent() {
                            Ok(percent) => {
                                als_context.with_daemon(|daemon| daemon.on_als_sample(percent))
                            }
                            Err(e) => warn!("Failed to read ambient light: {:#}", e),
                        }
                    }
                });
            }
            Err(e) => error!("Ambient light sensor configured but not found: {:#}", e),
        }
    }

    let (pref_sender, mut pref_receiver) = unbounded_channel();
    match watch_prefs_dir(&options.prefs_dir, pref_sender) {
        Ok(()) => {
            let pref_context = context.clone();
            tokio::spawn(async move {
                while let Some(name) = pref_receiver.recv().await {
                    pref_context.with_daemon(|daemon| daemon.on_pref_changed(&name));
                }
            });
        }
        Err(e) => warn!("Pref changes won't be picked up: {:#}", e),
    }

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    info!("powerd is ready");
    tokio::select! {
        _ = pump_timers(context) => {}
        _ = sigterm.recv() => info!("Received SIGTERM; exiting"),
    }
    Ok(())
}
