//! Pod inspection helpers.

use k8s_openapi::api::core::v1::Pod;

/// The pod's assigned IP, if the network is up.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

/// Whether the init container with the given name is currently in the
/// `Running` state.
pub fn is_init_container_running(pod: &Pod, container_name: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.init_container_statuses.as_ref())
        .is_some_and(|statuses| {
            statuses.iter().any(|status| {
                status.name == container_name
                    && status
                        .state
                        .as_ref()
                        .is_some_and(|state| state.running.is_some())
            })
        })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        PodStatus,
    };

    use super::*;

    fn pod_with_init_state(name: &str, state: ContainerState) -> Pod {
        Pod {
            status: Some(PodStatus {
                init_container_statuses: Some(vec![ContainerStatus {
                    name: name.to_string(),
                    state: Some(state),
                    ..ContainerStatus::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn running_init_container_is_detected() {
        let pod = pod_with_init_state(
            "cert-initializer",
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..ContainerState::default()
            },
        );

        assert!(is_init_container_running(&pod, "cert-initializer"));
        assert!(!is_init_container_running(&pod, "other"));
    }

    #[test]
    fn terminated_init_container_is_not_running() {
        let pod = pod_with_init_state(
            "cert-initializer",
            ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..ContainerState::default()
            },
        );

        assert!(!is_init_container_running(&pod, "cert-initializer"));
    }

    #[test]
    fn pod_without_status_has_no_ip() {
        assert_eq!(pod_ip(&Pod::default()), None);
    }
}
