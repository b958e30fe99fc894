//! Constants shared between components

/// Logical destination names as they appear in the broker configuration
pub mod destinations {
    /// Announcement of newly opened evaluations (one per deployment)
    pub const EVALUATIONS: &str = "evaluations";
    /// Statistics frames, extended by evaluation and consumer id
    pub const STATISTICS: &str = "statistics";
    /// Subscriber registrations, group acknowledgements and failures, extended by evaluation id
    pub const ACKNOWLEDGEMENTS: &str = "acknowledgements";
    /// Job status transitions, extended by job id
    pub const JOB_STATUS: &str = "job_status";

    /// Names which must resolve for a broker connection to be usable
    pub const REQUIRED: [&str; 4] = [EVALUATIONS, STATISTICS, ACKNOWLEDGEMENTS, JOB_STATUS];

    /// Physical addresses used when the configuration does not provide any
    pub const DEFAULT_ADDRESSES: [(&str, &str); 4] = [
        (EVALUATIONS, "evaluation.announcements"),
        (STATISTICS, "evaluation.statistics"),
        (ACKNOWLEDGEMENTS, "evaluation.acknowledgements"),
        (JOB_STATUS, "job.status"),
    ];
}

/// Default broker settings
pub mod broker {
    /// Host used when neither configuration file nor environment specify one
    pub const DEFAULT_HOST: &str = "localhost";
    /// Default port of the broker protocol
    pub const DEFAULT_PORT: u16 = 6379;
    /// Environment variable pointing at the broker configuration file
    pub const CONFIG_PATH_ENV: &str = "EVALBUS_BROKER_CONFIG";
    /// Configuration file looked up in the working directory
    pub const CONFIG_FILE_NAME: &str = "eventbroker.yaml";
    /// Environment variable overriding the configured host
    pub const ADDRESS_ENV: &str = "BROKER_ADDRESS";
    /// Environment variable overriding the configured port
    pub const PORT_ENV: &str = "BROKER_PORT";
}
