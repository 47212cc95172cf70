//! Scripted player used for smoke and load testing.

use crate::network::Connection;
use crate::protocol::{self, AvatarSummary, ServerEvent};
use crate::ClientError;
use log::{debug, info};
use rand::Rng;
use shared::channels::{OTP_DO_ID_TOONTOWN, OTP_ZONE_ID_DISTRICTS};
use shared::{Schema, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const DISTRICT_HANDLE: u16 = 1;
const ZONE_HANDLE: u16 = 2;
/// How far one step may move on each axis.
const MAX_STEP: f64 = 2.0;
/// Sizes of the server's name part tables.
const FIRST_NAMES: i16 = 12;
const LAST_NAME_HALVES: i16 = 8;

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub play_token: String,
    pub server_version: String,
    pub zone_id: u32,
    pub step_interval: Duration,
    /// Steps to take before leaving; zero walks until disconnected.
    pub steps: u32,
}

pub struct Bot {
    conn: Connection,
    schema: Schema,
    config: BotConfig,
    av_id: u32,
    position: (f64, f64),
    /// Objects currently visible, by do_id.
    seen: HashMap<u32, u16>,
}

impl Bot {
    pub fn new(conn: Connection, schema: Schema, config: BotConfig) -> Self {
        Self {
            conn,
            schema,
            config,
            av_id: 0,
            position: (0.0, 0.0),
            seen: HashMap::new(),
        }
    }

    pub fn avatar_id(&self) -> u32 {
        self.av_id
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    pub async fn run(mut self) -> Result<(), ClientError> {
        self.conn.login(&self.config.play_token, &self.config.server_version).await?;
        let avatar = self.choose_avatar().await?;
        self.enter_game(avatar.av_id).await?;
        let district = self.find_district().await?;
        self.join_zone(district).await?;
        self.wander().await?;
        self.conn.close().await
    }

    async fn choose_avatar(&mut self) -> Result<AvatarSummary, ClientError> {
        self.conn.send(&protocol::get_avatars()).await?;
        let avatars = match self
            .conn
            .wait_for(REPLY_TIMEOUT, |e| matches!(e, ServerEvent::AvatarList { .. }))
            .await?
        {
            ServerEvent::AvatarList { avatars, .. } => avatars,
            other => return Err(ClientError::Protocol(format!("unexpected {:?}", other))),
        };
        if let Some(avatar) = avatars.into_iter().next() {
            info!("Playing existing avatar {} ({})", avatar.name, avatar.av_id);
            return Ok(avatar);
        }

        let dna: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..15).map(|_| rng.gen()).collect()
        };
        self.conn.send(&protocol::create_avatar(&dna, 0)?).await?;
        match self
            .conn
            .wait_for(REPLY_TIMEOUT, |e| matches!(e, ServerEvent::CreateAvatarResponse { .. }))
            .await?
        {
            ServerEvent::CreateAvatarResponse {
                return_code: 0, av_id, ..
            } => {
                info!("Created avatar {}", av_id);
                self.name_avatar(av_id).await?;
                Ok(AvatarSummary {
                    av_id,
                    name: String::new(),
                    dna,
                    pos: 0,
                })
            }
            other => Err(ClientError::Protocol(format!("avatar creation failed: {:?}", other))),
        }
    }

    /// Picks a first name and a two-part last name at random.
    async fn name_avatar(&mut self, av_id: u32) -> Result<(), ClientError> {
        let parts = {
            let mut rng = rand::thread_rng();
            [
                (-1, 0),
                (rng.gen_range(0..FIRST_NAMES), 0),
                (rng.gen_range(0..LAST_NAME_HALVES), 0),
                (rng.gen_range(0..LAST_NAME_HALVES), 0),
            ]
        };
        self.conn.send(&protocol::set_name_pattern(av_id, parts)).await?;
        match self
            .conn
            .wait_for(REPLY_TIMEOUT, |e| matches!(e, ServerEvent::NamePatternAnswer { .. }))
            .await?
        {
            ServerEvent::NamePatternAnswer { return_code: 0, .. } => debug!("Avatar {} named", av_id),
            other => debug!("Avatar {} keeps its default name: {:?}", av_id, other),
        }
        Ok(())
    }

    async fn enter_game(&mut self, av_id: u32) -> Result<(), ClientError> {
        self.conn.send(&protocol::set_avatar(av_id)).await?;
        match self
            .conn
            .wait_for(REPLY_TIMEOUT, |e| matches!(e, ServerEvent::AvatarDetails { .. }))
            .await?
        {
            ServerEvent::AvatarDetails { return_code: 0, .. } => {
                self.av_id = av_id;
                Ok(())
            }
            other => Err(ClientError::Protocol(format!("could not play avatar: {:?}", other))),
        }
    }

    /// Opens interest in the district list and picks one at random.
    async fn find_district(&mut self) -> Result<u32, ClientError> {
        self.conn
            .send(&protocol::add_interest(
                DISTRICT_HANDLE,
                1,
                OTP_DO_ID_TOONTOWN,
                &[OTP_ZONE_ID_DISTRICTS],
            ))
            .await?;

        let district_class = self.schema.class_by_name("ToontownDistrict").map(|c| c.number);
        let mut districts = Vec::new();
        loop {
            match self.conn.recv_timeout(REPLY_TIMEOUT).await? {
                ServerEvent::ObjectCreate { do_id, dclass, .. } => {
                    self.seen.insert(do_id, dclass);
                    if Some(dclass) == district_class {
                        districts.push(do_id);
                    }
                }
                ServerEvent::InterestDone {
                    handle: DISTRICT_HANDLE,
                    ..
                } => break,
                ServerEvent::GoGetLost { code, reason } => return Err(ClientError::Rejected { code, reason }),
                other => debug!("Skipping {:?}", other),
            }
        }

        if districts.is_empty() {
            return Err(ClientError::Protocol("no districts are up".into()));
        }
        let pick = rand::thread_rng().gen_range(0..districts.len());
        info!("Joining district {}", districts[pick]);
        Ok(districts[pick])
    }

    async fn join_zone(&mut self, district: u32) -> Result<(), ClientError> {
        let zone = self.config.zone_id;
        self.conn
            .send(&protocol::object_location(self.av_id, district, zone))
            .await?;
        self.conn
            .send(&protocol::add_interest(ZONE_HANDLE, 2, district, &[zone]))
            .await?;
        let event = self
            .conn
            .wait_for(REPLY_TIMEOUT, |e| {
                matches!(e, ServerEvent::InterestDone { handle, .. } if *handle == ZONE_HANDLE)
            })
            .await?;
        debug!("Zone interest open: {:?}", event);
        Ok(())
    }

    fn step_payload(&mut self) -> Result<Option<(u16, Vec<u8>)>, ClientError> {
        let Some(dclass) = self.schema.class_by_name("DistributedToon") else {
            return Ok(None);
        };
        let Some(field) = self.schema.class_field(dclass, "setXY") else {
            return Ok(None);
        };

        let mut rng = rand::thread_rng();
        self.position.0 += rng.gen_range(-MAX_STEP..MAX_STEP);
        self.position.1 += rng.gen_range(-MAX_STEP..MAX_STEP);
        let payload = field
            .pack(&[Value::Float(self.position.0), Value::Float(self.position.1)])
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        Ok(Some((field.number, payload)))
    }

    async fn wander(&mut self) -> Result<(), ClientError> {
        let mut ticker = interval(self.config.step_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut steps = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some((field, payload)) = self.step_payload()? {
                        self.conn.send(&protocol::update_field(self.av_id, field, &payload)).await?;
                    }
                    self.conn.send(&protocol::heartbeat()).await?;
                    steps += 1;
                    if self.config.steps > 0 && steps >= self.config.steps {
                        info!("Walked {} steps, leaving", steps);
                        return Ok(());
                    }
                }
                event = self.conn.recv() => match event? {
                    ServerEvent::ObjectCreate { do_id, dclass, .. } => {
                        self.seen.insert(do_id, dclass);
                    }
                    ServerEvent::ObjectDisable { do_id } => {
                        self.seen.remove(&do_id);
                    }
                    ServerEvent::GoGetLost { code, reason } => {
                        return Err(ClientError::Rejected { code, reason });
                    }
                    _ => {}
                },
            }
        }
    }
}
