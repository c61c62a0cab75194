use crate::{
    config::ServerConfig,
    data_channel::DataSender,
    enter_code::EnterCodes,
    experiment::ExperimentOrchestrator,
    facade::RequestFacade,
    game::{GameManager, LogResultSink, ResultSink},
    lobby::LobbyManager,
    registry::ClientRegistry,
    session::SessionQueue,
    timesync::{TimeSyncService, TimeSyncSettings},
};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;

/// Every long-lived service of the server, wired together.
pub struct ServerContext {
    pub registry: Arc<ClientRegistry>,
    pub enter_codes: Arc<EnterCodes>,
    pub lobbies: Arc<LobbyManager>,
    pub games: Arc<GameManager>,
    pub time_sync: Arc<TimeSyncService>,
    pub data: DataSender,
    pub facade: RequestFacade,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, data_socket: Arc<UdpSocket>) -> Arc<Self> {
        Self::with_result_sink(config, data_socket, Arc::new(LogResultSink))
    }

    pub fn with_result_sink(
        config: &ServerConfig,
        data_socket: Arc<UdpSocket>,
        results: Arc<dyn ResultSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new(config.heartbeat_timeout()));
        let enter_codes = Arc::new(EnterCodes::new(config.enter_code_ttl()));
        let lobbies = Arc::new(LobbyManager::new(Arc::clone(&registry)));
        let sessions = Arc::new(SessionQueue::new(Arc::clone(&lobbies)));
        let time_sync = Arc::new(TimeSyncService::new(
            config.time_source,
            TimeSyncSettings {
                request_timeout: config.timesync_timeout(),
                batch_interval: config.timesync_interval(),
                batch_size: config.timesync_samples,
                trim: config.timesync_trim,
            },
        ));
        let data = DataSender::new(data_socket);
        let games = Arc::new(GameManager::new(
            Arc::clone(&registry),
            Arc::clone(&lobbies),
            Arc::clone(&time_sync),
            data.clone(),
            results,
            config.game_start_delay_ms,
        ));
        let experiments = Arc::new(ExperimentOrchestrator::new(
            Arc::clone(&lobbies),
            Arc::clone(&sessions),
            Arc::clone(&games),
            config.experiment_poll(),
        ));

        let handler: Weak<ExperimentOrchestrator> = Arc::downgrade(&experiments);
        games.set_termination_handler(handler);

        // Games end before their lobby is left
        registry.add_observer(games.clone());
        registry.add_observer(lobbies.clone());
        registry.add_observer(enter_codes.clone());

        lobbies.add_observer(games.clone());
        lobbies.add_observer(sessions.clone());
        lobbies.add_observer(experiments.clone());

        let facade = RequestFacade::new(
            Arc::clone(&registry),
            Arc::clone(&lobbies),
            sessions,
            Arc::clone(&games),
            experiments,
        );

        Arc::new(Self {
            registry,
            enter_codes,
            lobbies,
            games,
            time_sync,
            data,
            facade,
        })
    }
}
