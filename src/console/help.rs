pub const HELP: &str = r#"
Available console commands:

start                                       -- start the update server
stop                                        -- stop the update server and disconnect all clients
status                                      -- show the server state and connected clients
update                                      -- send an update to clients right now
debug enable|disable                        -- switch debug logging
si, stepi                                   -- execute one instruction
c, continue                                 -- continue the debuggee until the next signal
h, help                                     -- show help
q, quit                                     -- stop the server and exit
"#;
