/// Return a sorted list of available ports as (port_name, port_type_string).
pub fn enumerate_ports() -> Vec<(String, String)> {
    let mut ports = serialport::available_ports().unwrap_or_default();
    ports.sort_by_key(|p| p.port_name.clone());
    ports
        .into_iter()
        .map(|p| (p.port_name.clone(), format!("{:?}", p.port_type)))
        .collect()
}
