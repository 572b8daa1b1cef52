//! CP-008: Built-in mapping rules.
//!
//! Chef built-ins map to `ansible.builtin` (or the collection that owns the
//! equivalent module). The community custom resources at the bottom are the
//! ones every migration runs into first.

use super::rule::MappingRule;

const PACKAGE_ACTIONS: &[(&str, &str)] = &[
    ("install", "present"),
    ("upgrade", "latest"),
    ("remove", "absent"),
    ("purge", "absent"),
    ("nothing", "present"),
];

const SERVICE_ACTIONS: &[(&str, &str)] = &[
    ("start", "started"),
    ("stop", "stopped"),
    ("restart", "restarted"),
    ("reload", "reloaded"),
];

const CREATE_DELETE: &[(&str, &str)] = &[
    ("create", "present"),
    ("delete", "absent"),
    ("remove", "absent"),
];

const ENABLE_STATE: &[(&str, &str)] = &[("true", "present"), ("false", "absent")];

fn package(source: &str, target: &str) -> MappingRule {
    MappingRule::new(source, target)
        .rename("package_name", "name")
        .rename("action", "state")
        .transform("action", PACKAGE_ACTIONS)
}

/// Every built-in rule, in registration order.
pub fn default_rules() -> Vec<MappingRule> {
    vec![
        // packages
        package("package", "ansible.builtin.package"),
        package("apt_package", "ansible.builtin.apt"),
        package("yum_package", "ansible.builtin.yum"),
        package("dnf_package", "ansible.builtin.dnf"),
        package("gem_package", "community.general.gem"),
        package("chef_gem", "community.general.gem"),
        package("snap_package", "community.general.snap"),
        package("homebrew_package", "community.general.homebrew"),
        // services
        MappingRule::new("service", "ansible.builtin.service")
            .rename("service_name", "name")
            .rename("action", "state")
            .transform("action", SERVICE_ACTIONS),
        MappingRule::new("systemd_unit", "ansible.builtin.systemd")
            .rename("unit_name", "name")
            .rename("action", "state")
            .transform(
                "action",
                &[
                    ("start", "started"),
                    ("stop", "stopped"),
                    ("enable", "enabled"),
                    ("disable", "disabled"),
                ],
            ),
        // files
        MappingRule::new("template", "ansible.builtin.template")
            .rename("source", "src")
            .rename("path", "dest"),
        MappingRule::new("directory", "ansible.builtin.file")
            .rename("recursive", "recurse")
            .rename("action", "state")
            .transform("action", &[("create", "directory"), ("delete", "absent")]),
        MappingRule::new("file", "ansible.builtin.copy")
            .rename("path", "dest")
            .rename("action", "state")
            .transform("action", CREATE_DELETE),
        MappingRule::new("cookbook_file", "ansible.builtin.copy")
            .rename("source", "src")
            .rename("path", "dest"),
        MappingRule::new("remote_file", "ansible.builtin.get_url")
            .rename("source", "url")
            .rename("path", "dest"),
        MappingRule::new("link", "ansible.builtin.file")
            .rename("target_file", "path")
            .rename("to", "src"),
        // commands
        MappingRule::new("execute", "ansible.builtin.command")
            .rename("command", "cmd")
            .rename("cwd", "chdir"),
        MappingRule::new("bash", "ansible.builtin.shell")
            .rename("code", "cmd")
            .rename("cwd", "chdir"),
        MappingRule::new("script", "ansible.builtin.shell")
            .rename("code", "cmd")
            .rename("cwd", "chdir"),
        MappingRule::new("log", "ansible.builtin.debug").rename("message", "msg"),
        // accounts
        MappingRule::new("user", "ansible.builtin.user")
            .rename("username", "name")
            .rename("manage_home", "create_home")
            .rename("gid", "group")
            .rename("action", "state")
            .transform("action", CREATE_DELETE),
        MappingRule::new("group", "ansible.builtin.group")
            .rename("group_name", "name")
            .rename("action", "state")
            .transform("action", CREATE_DELETE),
        // system
        MappingRule::new("cron", "ansible.builtin.cron")
            .rename("command", "job")
            .rename("action", "state")
            .transform("action", CREATE_DELETE),
        MappingRule::new("mount", "ansible.posix.mount")
            .rename("mount_point", "path")
            .rename("device", "src")
            .rename("options", "opts")
            .rename("action", "state")
            .transform(
                "action",
                &[
                    ("mount", "mounted"),
                    ("umount", "unmounted"),
                    ("unmount", "unmounted"),
                    ("enable", "present"),
                    ("disable", "absent"),
                ],
            ),
        MappingRule::new("git", "ansible.builtin.git")
            .rename("repository", "repo")
            .rename("destination", "dest")
            .rename("revision", "version"),
        MappingRule::new("apt_repository", "ansible.builtin.apt_repository").rename("uri", "repo"),
        MappingRule::new("apt_update", "ansible.builtin.apt"),
        MappingRule::new("yum_repository", "ansible.builtin.yum_repository")
            .rename("repositoryid", "name"),
        MappingRule::new("sysctl", "ansible.posix.sysctl").rename("key", "name"),
        MappingRule::new("hostname", "ansible.builtin.hostname").rename("hostname", "name"),
        MappingRule::new("timezone", "community.general.timezone").rename("timezone", "name"),
        // community custom resources
        MappingRule::new("mysql_database", "community.mysql.mysql_db")
            .rename("database_name", "name")
            .rename("connection", "login_host")
            .rename("user", "login_user")
            .rename("password", "login_password"),
        MappingRule::new("postgresql_database", "community.postgresql.postgresql_db")
            .rename("database_name", "name")
            .rename("connection", "login_host")
            .rename("user", "login_user")
            .rename("password", "login_password"),
        MappingRule::new("apache2_site", "community.general.apache2_module")
            .rename("site_name", "name")
            .rename("enable", "state")
            .transform("enable", ENABLE_STATE),
        MappingRule::new("nginx_site", "community.general.nginx_site")
            .rename("site_name", "name")
            .rename("enable", "state")
            .transform("enable", ENABLE_STATE),
        MappingRule::new("cron_job", "ansible.builtin.cron").rename("command", "job"),
    ]
}
