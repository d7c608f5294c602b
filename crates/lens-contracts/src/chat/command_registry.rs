#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "model",
    action: "set_model",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "image",
        action: "set_active_image",
    },
    CommandSpec {
        command: "use",
        action: "set_active_image",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "clear",
        action: "reset",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub(crate) const EXPORT_COMMAND: CommandSpec = CommandSpec {
    command: "export",
    action: "export",
};

pub(crate) const DEFAULT_EXPORT_PATH: &str = "transcript.html";

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/image <path>",
    "/reset",
    "/model <name>",
    "/models",
    "/history",
    "/export [path]",
    "/help",
    "/quit",
];
